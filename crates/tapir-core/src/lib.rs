pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod query;
pub mod service;
pub mod uws;

// Re-export commonly used types
pub use config::{Config, DatabaseConfig, LoggingConfig, ServerConfig, ServiceConfig};
pub use db::create_pool;
pub use error::{Error, Result};
pub use identity::{AnonymousIdentifier, HeaderIdentifier, UserIdentifier};
pub use metadata::{ColumnDef, MetadataProvider, StaticMetadata, TableDef};
pub use query::{
    ConnectionPool, FormatterRegistry, QueryError, QueryParser, QueryPipeline, QueryTranslator,
    RequestParams, ResultFormatter, SqlxConnectionPool, TapParams,
};
pub use service::{ServiceComponents, SyncStream, TapService, ASYNC_LIST};
pub use uws::{
    ErrorSummary, ErrorType, ExecutionProgression, Job, JobHandle, JobPhase, JobResult, PhaseWait,
    UwsError,
};

/// Current version of tapir
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
