//! SQL translation contract and the PostgreSQL dialect translator

use regex::Regex;

use crate::query::parser::ParsedQuery;
use crate::query::QueryError;

/// Translator collaborator seam
///
/// `row_limit` is the limit enforced by the service (already including
/// the overflow sentinel); `upload_tables` maps ADQL upload-table names
/// to their materialized SQL names for this job.
pub trait QueryTranslator: Send + Sync {
    fn translate(
        &self,
        query: &ParsedQuery,
        row_limit: Option<i64>,
        upload_tables: &[(String, String)],
    ) -> Result<String, QueryError>;
}

/// Translates the reference parser's output to PostgreSQL
///
/// ADQL TOP becomes LIMIT, references to the TAP_UPLOAD schema are
/// rewritten to the job's materialized tables, and the service row
/// limit is injected when it is stricter than the query's own.
pub struct PostgresTranslator;

impl PostgresTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgresTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryTranslator for PostgresTranslator {
    fn translate(
        &self,
        query: &ParsedQuery,
        row_limit: Option<i64>,
        upload_tables: &[(String, String)],
    ) -> Result<String, QueryError> {
        let mut sql = query.body.clone();

        for (adql_name, sql_name) in upload_tables {
            let pattern = format!(r"(?i)\btap_upload\.{}\b", regex::escape(adql_name));
            let re = Regex::new(&pattern)
                .map_err(|e| QueryError::Translate(format!("Bad upload table name: {}", e)))?;
            sql = re.replace_all(&sql, sql_name.as_str()).into_owned();
        }

        let effective = match (query.top, row_limit) {
            (Some(top), Some(limit)) => Some(top.min(limit)),
            (Some(top), None) => Some(top),
            (None, Some(limit)) => Some(limit),
            (None, None) => None,
        };

        if let Some(limit) = effective {
            sql = format!("{} LIMIT {}", sql.trim_end_matches(';').trim_end(), limit);
        }

        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::{AdqlParser, QueryParser};

    fn parse(text: &str) -> ParsedQuery {
        AdqlParser::new().parse(text).unwrap()
    }

    #[test]
    fn test_limit_injected_when_absent() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT * FROM stars"), Some(11), &[])
            .unwrap();
        assert_eq!(sql, "SELECT * FROM stars LIMIT 11");
    }

    #[test]
    fn test_top_becomes_limit() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT TOP 3 * FROM stars"), None, &[])
            .unwrap();
        assert_eq!(sql, "SELECT * FROM stars LIMIT 3");
    }

    #[test]
    fn test_stricter_service_limit_wins() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT TOP 500 * FROM stars"), Some(11), &[])
            .unwrap();
        assert!(sql.ends_with("LIMIT 11"));
    }

    #[test]
    fn test_query_top_below_service_limit_kept() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT TOP 3 * FROM stars"), Some(11), &[])
            .unwrap();
        assert!(sql.ends_with("LIMIT 3"));
    }

    #[test]
    fn test_no_limit_at_all() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT a FROM stars"), None, &[])
            .unwrap();
        assert_eq!(sql, "SELECT a FROM stars");
    }

    #[test]
    fn test_upload_table_rewritten() {
        let sql = PostgresTranslator::new()
            .translate(
                &parse("SELECT s.ra FROM TAP_UPLOAD.mine AS s"),
                None,
                &[("mine".to_string(), "tap_upload.j42_mine".to_string())],
            )
            .unwrap();
        assert_eq!(sql, "SELECT s.ra FROM tap_upload.j42_mine AS s");
    }

    #[test]
    fn test_trailing_semicolon_stripped_before_limit() {
        let sql = PostgresTranslator::new()
            .translate(&parse("SELECT 1;"), Some(5), &[])
            .unwrap();
        assert_eq!(sql, "SELECT 1 LIMIT 5");
    }
}
