//! Database connection pool contract and the sqlx-backed implementation

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::query::cursor::{ColumnDesc, ColumnType, FieldValue, MemoryCursor, RowCursor};
use crate::query::QueryError;

/// Best-effort interruption of a query in flight
///
/// Obtained before the blocking call so it can be fired from another
/// task while the connection itself is busy.
#[async_trait]
pub trait QueryCancel: Send + Sync {
    async fn cancel(&self);
}

/// One reserved database connection
#[async_trait]
pub trait TapConnection: Send {
    /// Run a row-returning statement
    async fn execute_query(&mut self, sql: &str) -> Result<Box<dyn RowCursor>, QueryError>;

    /// Run a DDL or DML statement; returns affected rows
    async fn execute_update(&mut self, sql: &str) -> Result<u64, QueryError>;

    /// Cancel hook for the statement currently running on this connection
    fn cancel_handle(&self) -> Arc<dyn QueryCancel>;
}

/// Bounded pool of DB connections
///
/// Opaque to the scheduler beyond these three operations; `acquire`
/// fails fast rather than blocking.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self, job_id: &str) -> Result<Box<dyn TapConnection>, QueryError>;

    async fn release(&self, conn: Box<dyn TapConnection>);

    /// Non-blocking estimate; non-negative in correct operation
    fn free_count(&self) -> i64;
}

/// sqlx-backed pool
///
/// Releasing a connection pings the execution manager so queued jobs
/// get a fresh admission pass.
pub struct SqlxConnectionPool {
    pool: PgPool,
    refresh_notify: std::sync::OnceLock<Arc<Notify>>,
}

impl SqlxConnectionPool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            refresh_notify: std::sync::OnceLock::new(),
        }
    }

    /// Wire the scheduler's refresh signal; done once at service start
    pub fn attach_refresh_notify(&self, notify: Arc<Notify>) {
        let _ = self.refresh_notify.set(notify);
    }
}

#[async_trait]
impl ConnectionPool for SqlxConnectionPool {
    async fn acquire(&self, job_id: &str) -> Result<Box<dyn TapConnection>, QueryError> {
        let mut conn = self
            .pool
            .try_acquire()
            .ok_or(QueryError::NoConnection)?;

        // The backend pid enables pg_cancel_backend from a sibling
        // connection while this one is busy
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| QueryError::Execution(sanitize_db_error(&e)))?;

        debug!(
            "Connection reserved for job {}: backend_pid={}",
            job_id, backend_pid
        );

        Ok(Box::new(SqlxTapConnection {
            conn: Some(conn),
            backend_pid,
            pool: self.pool.clone(),
        }))
    }

    async fn release(&self, conn: Box<dyn TapConnection>) {
        // Dropping the sqlx connection returns it to the pool
        drop(conn);
        if let Some(notify) = self.refresh_notify.get() {
            notify.notify_one();
        }
    }

    fn free_count(&self) -> i64 {
        self.pool.num_idle() as i64
    }
}

struct SqlxTapConnection {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>>,
    backend_pid: i32,
    pool: PgPool,
}

#[async_trait]
impl TapConnection for SqlxTapConnection {
    async fn execute_query(&mut self, sql: &str) -> Result<Box<dyn RowCursor>, QueryError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| QueryError::Execution("Connection already released".to_string()))?;

        let rows: Vec<PgRow> = sqlx::query(sql)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| QueryError::Execution(sanitize_db_error(&e)))?;

        let columns = match rows.first() {
            Some(row) => row
                .columns()
                .iter()
                .map(|col| ColumnDesc::new(col.name(), map_pg_type(col.type_info().name())))
                .collect(),
            None => Vec::new(),
        };

        let decoded = rows
            .iter()
            .map(|row| decode_row(row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(MemoryCursor::new(columns, decoded)))
    }

    async fn execute_update(&mut self, sql: &str) -> Result<u64, QueryError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| QueryError::Execution("Connection already released".to_string()))?;

        let done = sqlx::query(sql)
            .execute(&mut **conn)
            .await
            .map_err(|e| QueryError::Execution(sanitize_db_error(&e)))?;
        Ok(done.rows_affected())
    }

    fn cancel_handle(&self) -> Arc<dyn QueryCancel> {
        Arc::new(PgBackendCancel {
            pool: self.pool.clone(),
            backend_pid: self.backend_pid,
        })
    }
}

struct PgBackendCancel {
    pool: PgPool,
    backend_pid: i32,
}

#[async_trait]
impl QueryCancel for PgBackendCancel {
    async fn cancel(&self) {
        match sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .fetch_one(&self.pool)
            .await
        {
            Ok(cancelled) => {
                debug!(
                    "pg_cancel_backend({}) -> {}",
                    self.backend_pid, cancelled
                );
            }
            Err(e) => {
                warn!(
                    "Could not cancel backend {}: {}",
                    self.backend_pid,
                    sanitize_db_error(&e)
                );
            }
        }
    }
}

/// Strip connection details the DBMS may embed in its messages
fn sanitize_db_error(error: &sqlx::Error) -> String {
    match error {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

fn map_pg_type(name: &str) -> ColumnType {
    match name {
        "INT2" | "SMALLINT" => ColumnType::Short,
        "INT4" | "INT" => ColumnType::Int,
        "INT8" | "BIGINT" => ColumnType::Long,
        "FLOAT4" | "REAL" => ColumnType::Float,
        "FLOAT8" | "DOUBLE PRECISION" | "NUMERIC" => ColumnType::Double,
        "BOOL" => ColumnType::Boolean,
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" => ColumnType::Timestamp,
        _ => ColumnType::Char,
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<FieldValue>, QueryError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, col) in row.columns().iter().enumerate() {
        let value = match map_pg_type(col.type_info().name()) {
            ColumnType::Short | ColumnType::Int | ColumnType::Long => row
                .try_get::<Option<i64>, _>(idx)
                .or_else(|_| row.try_get::<Option<i32>, _>(idx).map(|v| v.map(i64::from)))
                .or_else(|_| row.try_get::<Option<i16>, _>(idx).map(|v| v.map(i64::from)))
                .map(|v| v.map_or(FieldValue::Null, FieldValue::Int)),
            ColumnType::Float | ColumnType::Double => row
                .try_get::<Option<f64>, _>(idx)
                .or_else(|_| row.try_get::<Option<f32>, _>(idx).map(|v| v.map(f64::from)))
                .map(|v| v.map_or(FieldValue::Null, FieldValue::Double)),
            ColumnType::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map_or(FieldValue::Null, FieldValue::Bool)),
            ColumnType::Timestamp => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .map(|v| {
                    v.map_or(FieldValue::Null, |ts| {
                        FieldValue::Text(ts.format("%Y-%m-%dT%H:%M:%S").to_string())
                    })
                }),
            ColumnType::Char => row
                .try_get::<Option<String>, _>(idx)
                .map(|v| v.map_or(FieldValue::Null, FieldValue::Text)),
        };

        match value {
            Ok(v) => values.push(v),
            // Unknown representation: fall back to text, then to NULL
            Err(_) => values.push(
                row.try_get::<Option<String>, _>(idx)
                    .map(|v| v.map_or(FieldValue::Null, FieldValue::Text))
                    .unwrap_or(FieldValue::Null),
            ),
        }
    }
    Ok(values)
}
