//! Query execution pipeline
//!
//! The staged path from a submitted query to a written result:
//! upload -> parse -> translate -> execute -> serialize, with per-stage
//! timing, cooperative cancellation and guaranteed cleanup. The ADQL
//! parser, the SQL translator, the result writers and the connection
//! pool are collaborator seams; reference implementations ship alongside
//! the contracts.

pub mod connection;
pub mod cursor;
pub mod format;
pub mod params;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod sink;
pub mod translator;
pub mod upload;

pub use connection::{ConnectionPool, QueryCancel, SqlxConnectionPool, TapConnection};
pub use cursor::{ColumnDesc, ColumnType, FieldValue, MemoryCursor, RowCursor};
pub use format::{FormatterRegistry, ResultFormatter, WriteContext};
pub use params::{RequestParams, TapParams, UploadDef, UploadSource};
pub use parser::{AdqlParser, ParsedQuery, QueryParser};
pub use pipeline::{PipelineContext, QueryPipeline};
pub use report::{ExecutionReport, StageTimer};
pub use sink::{ChannelSink, ChunkedWriter, FileSink, ResultSink};
pub use translator::{PostgresTranslator, QueryTranslator};
pub use upload::UploadManager;

/// Error types for the query pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Syntax error at character {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Translation error: {0}")]
    Translate(String),

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Result write failed: {0}")]
    Write(String),

    #[error("Client went away while the result was being written: {0}")]
    WriteAborted(String),

    #[error("Query interrupted")]
    Interrupted,

    #[error("No database connection available")]
    NoConnection,

    #[error("Unknown output format: {0}")]
    UnknownFormat(String),
}

impl QueryError {
    /// Whether this fault is the client's doing rather than the service's
    pub fn is_client_abort(&self) -> bool {
        matches!(self, QueryError::WriteAborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_carries_position() {
        let err = QueryError::Parse {
            position: 12,
            message: "unbalanced parenthesis".into(),
        };
        assert!(err.to_string().contains("character 12"));
    }

    #[test]
    fn test_client_abort_classification() {
        assert!(QueryError::WriteAborted("broken pipe".into()).is_client_abort());
        assert!(!QueryError::Write("disk full".into()).is_client_abort());
    }
}
