//! Materialization of client-uploaded tables

use tracing::{debug, info};

use crate::query::connection::TapConnection;
use crate::query::params::{UploadDef, UploadSource};
use crate::query::QueryError;

/// Hard cap on one uploaded table body
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Rows per INSERT statement
const INSERT_BATCH: usize = 100;

/// Creates and drops per-job temporary tables in the upload schema
///
/// Each job owns a disjoint sub-namespace: its tables are named
/// `<schema>."<job id>_<table>"`, so jobs can never interfere with each
/// other's uploads.
pub struct UploadManager {
    schema: String,
    client: reqwest::Client,
}

impl UploadManager {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// SQL name of an uploaded table within a job's sub-namespace
    pub fn qualified_name(&self, job_id: &str, table: &str) -> String {
        format!("{}.\"{}_{}\"", self.schema, job_id, table)
    }

    /// Materialize every descriptor as a temporary table
    ///
    /// Idempotent with respect to the job's sub-namespace: previous
    /// temporaries for this job are dropped before new ones are created.
    /// Returns (ADQL name, SQL name) pairs for the translator.
    pub async fn materialize(
        &self,
        conn: &mut dyn TapConnection,
        job_id: &str,
        uploads: &[UploadDef],
    ) -> Result<Vec<(String, String)>, QueryError> {
        if uploads.is_empty() {
            return Ok(Vec::new());
        }

        conn.execute_update(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .await
            .map_err(|e| QueryError::Upload(format!("Cannot prepare upload schema: {}", e)))?;

        let names: Vec<String> = uploads.iter().map(|u| u.name.clone()).collect();
        self.drop_tables(conn, job_id, &names).await?;

        let mut mapping = Vec::with_capacity(uploads.len());
        for def in uploads {
            let body = self.resolve_body(def).await?;
            let sql_name = self.qualified_name(job_id, &def.name);
            self.create_from_csv(conn, &sql_name, &body).await?;
            info!(
                "Uploaded table materialized: job={}, table={}, bytes={}",
                job_id,
                def.name,
                body.len()
            );
            mapping.push((def.name.clone(), sql_name));
        }
        Ok(mapping)
    }

    /// Drop the named tables from a job's sub-namespace
    pub async fn drop_tables(
        &self,
        conn: &mut dyn TapConnection,
        job_id: &str,
        tables: &[String],
    ) -> Result<(), QueryError> {
        for table in tables {
            let sql_name = self.qualified_name(job_id, table);
            conn.execute_update(&format!("DROP TABLE IF EXISTS {}", sql_name))
                .await
                .map_err(|e| QueryError::Upload(format!("Cannot drop {}: {}", sql_name, e)))?;
            debug!("Dropped uploaded table {}", sql_name);
        }
        Ok(())
    }

    async fn resolve_body(&self, def: &UploadDef) -> Result<Vec<u8>, QueryError> {
        let body = match &def.source {
            UploadSource::Inline(bytes) => bytes.clone(),
            UploadSource::Uri(uri) => {
                let response = self.client.get(uri).send().await.map_err(|e| {
                    QueryError::Upload(format!("Cannot fetch {}: {}", uri, e))
                })?;
                if !response.status().is_success() {
                    return Err(QueryError::Upload(format!(
                        "Cannot fetch {}: HTTP {}",
                        uri,
                        response.status()
                    )));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| QueryError::Upload(format!("Transfer of {} broke off: {}", uri, e)))?
                    .to_vec()
            }
        };

        if body.len() > MAX_UPLOAD_BYTES {
            return Err(QueryError::Upload(format!(
                "Uploaded table {} exceeds the {} byte limit",
                def.name, MAX_UPLOAD_BYTES
            )));
        }
        Ok(body)
    }

    async fn create_from_csv(
        &self,
        conn: &mut dyn TapConnection,
        sql_name: &str,
        body: &[u8],
    ) -> Result<(), QueryError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(body);

        let headers = reader
            .headers()
            .map_err(|e| QueryError::Upload(format!("Unreadable table header: {}", e)))?
            .clone();
        if headers.is_empty() {
            return Err(QueryError::Upload("Uploaded table has no columns".into()));
        }

        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| sanitize_column(name, i))
            .collect();

        let ddl = format!(
            "CREATE TABLE {} ({})",
            sql_name,
            columns
                .iter()
                .map(|c| format!("{} TEXT", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        conn.execute_update(&ddl)
            .await
            .map_err(|e| QueryError::Upload(format!("Cannot create {}: {}", sql_name, e)))?;

        let mut batch: Vec<String> = Vec::with_capacity(INSERT_BATCH);
        for record in reader.records() {
            let record =
                record.map_err(|e| QueryError::Upload(format!("Unreadable table row: {}", e)))?;
            if record.len() != columns.len() {
                return Err(QueryError::Upload(format!(
                    "Row has {} values, expected {}",
                    record.len(),
                    columns.len()
                )));
            }
            let values: Vec<String> = record.iter().map(escape_literal).collect();
            batch.push(format!("({})", values.join(", ")));

            if batch.len() >= INSERT_BATCH {
                self.flush_batch(conn, sql_name, &columns, &mut batch).await?;
            }
        }
        self.flush_batch(conn, sql_name, &columns, &mut batch).await?;
        Ok(())
    }

    async fn flush_batch(
        &self,
        conn: &mut dyn TapConnection,
        sql_name: &str,
        columns: &[String],
        batch: &mut Vec<String>,
    ) -> Result<(), QueryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO {} ({}) VALUES {}",
            sql_name,
            columns.join(", "),
            batch.join(", ")
        );
        batch.clear();
        conn.execute_update(&insert)
            .await
            .map_err(|e| QueryError::Upload(format!("Cannot load rows into {}: {}", sql_name, e)))?;
        Ok(())
    }
}

fn sanitize_column(name: &str, index: usize) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => cleaned,
        _ => format!("col_{}", index),
    }
}

fn escape_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::connection::tests_support::StubPool;
    use crate::query::connection::ConnectionPool;

    fn defs(body: &[u8]) -> Vec<UploadDef> {
        vec![UploadDef {
            name: "mine".to_string(),
            source: UploadSource::Inline(body.to_vec()),
        }]
    }

    #[tokio::test]
    async fn test_materialize_creates_and_loads() {
        let pool = StubPool::with_free(1);
        let mut conn = pool.acquire("j1").await.unwrap();
        let manager = UploadManager::new("tap_upload");

        let mapping = manager
            .materialize(conn.as_mut(), "j1", &defs(b"ra,dec\n1.5,2.5\n3.5,4.5\n"))
            .await
            .unwrap();

        assert_eq!(mapping, vec![("mine".to_string(), "tap_upload.\"j1_mine\"".to_string())]);
        let sql = pool.executed_sql();
        assert!(sql.iter().any(|s| s.starts_with("CREATE SCHEMA")));
        assert!(sql
            .iter()
            .any(|s| s == "DROP TABLE IF EXISTS tap_upload.\"j1_mine\""));
        assert!(sql
            .iter()
            .any(|s| s == "CREATE TABLE tap_upload.\"j1_mine\" (ra TEXT, dec TEXT)"));
        assert!(sql.iter().any(|s| s.starts_with("INSERT INTO tap_upload.\"j1_mine\"")
            && s.contains("('1.5', '2.5'), ('3.5', '4.5')")));
    }

    #[tokio::test]
    async fn test_quote_in_value_escaped() {
        let pool = StubPool::with_free(1);
        let mut conn = pool.acquire("j1").await.unwrap();
        let manager = UploadManager::new("tap_upload");

        manager
            .materialize(conn.as_mut(), "j1", &defs(b"name\nO'Neill\n"))
            .await
            .unwrap();

        let sql = pool.executed_sql();
        assert!(sql.iter().any(|s| s.contains("('O''Neill')")));
    }

    #[tokio::test]
    async fn test_ragged_row_fails_upload() {
        let pool = StubPool::with_free(1);
        let mut conn = pool.acquire("j1").await.unwrap();
        let manager = UploadManager::new("tap_upload");

        let err = manager
            .materialize(conn.as_mut(), "j1", &defs(b"a,b\n1,2\n3,4,5,6,7\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Upload(_)));
    }

    #[tokio::test]
    async fn test_odd_headers_sanitized() {
        let pool = StubPool::with_free(1);
        let mut conn = pool.acquire("j1").await.unwrap();
        let manager = UploadManager::new("tap_upload");

        manager
            .materialize(conn.as_mut(), "j1", &defs(b"RA (deg),2mass\n1,2\n"))
            .await
            .unwrap();

        let sql = pool.executed_sql();
        assert!(sql
            .iter()
            .any(|s| s.contains("(ra__deg_ TEXT, col_1 TEXT)")));
    }

    #[tokio::test]
    async fn test_no_uploads_is_a_no_op() {
        let pool = StubPool::with_free(1);
        let mut conn = pool.acquire("j1").await.unwrap();
        let manager = UploadManager::new("tap_upload");
        let mapping = manager.materialize(conn.as_mut(), "j1", &[]).await.unwrap();
        assert!(mapping.is_empty());
        assert!(pool.executed_sql().is_empty());
    }
}
