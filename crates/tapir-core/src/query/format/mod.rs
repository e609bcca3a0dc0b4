//! Result serialization contract and the shipped writers

pub mod csv;
pub mod votable;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::query::cursor::RowCursor;
use crate::query::sink::ChunkedWriter;
use crate::query::QueryError;

pub use self::csv::CsvFormatter;
pub use self::votable::VoTableFormatter;

/// Flags handed to a writer alongside the cursor
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteContext {
    /// The row cap was exceeded; writers emit their overflow indicator
    pub overflow: bool,
}

/// Result writer collaborator seam
#[async_trait]
pub trait ResultFormatter: Send + Sync {
    /// MIME type of the serialized body
    fn content_type(&self) -> &'static str;

    /// Short alias accepted in the FORMAT parameter
    fn short_alias(&self) -> &'static str;

    /// Extension for persisted result files
    fn file_extension(&self) -> &'static str;

    /// Stream the cursor into the writer; returns rows written
    async fn write(
        &self,
        cursor: &mut dyn RowCursor,
        out: &mut ChunkedWriter,
        ctx: &WriteContext,
        cancel: &CancellationToken,
    ) -> Result<u64, QueryError>;
}

/// Formatters by short alias and MIME type
pub struct FormatterRegistry {
    by_key: HashMap<String, Arc<dyn ResultFormatter>>,
    default_alias: String,
}

impl FormatterRegistry {
    pub fn new(default_alias: impl Into<String>) -> Self {
        Self {
            by_key: HashMap::new(),
            default_alias: default_alias.into(),
        }
    }

    /// Registry with the shipped writers (VOTable default)
    pub fn standard(default_alias: impl Into<String>) -> Self {
        let mut registry = Self::new(default_alias);
        registry.register(Arc::new(VoTableFormatter::new()));
        registry.register(Arc::new(CsvFormatter::new()));
        registry
    }

    pub fn register(&mut self, formatter: Arc<dyn ResultFormatter>) {
        self.by_key
            .insert(formatter.short_alias().to_ascii_lowercase(), formatter.clone());
        self.by_key
            .insert(formatter.content_type().to_ascii_lowercase(), formatter);
    }

    /// Resolve a FORMAT value (alias or MIME), falling back to the default
    pub fn resolve(&self, format: Option<&str>) -> Result<Arc<dyn ResultFormatter>, QueryError> {
        let key = format.unwrap_or(&self.default_alias).trim().to_ascii_lowercase();
        self.by_key
            .get(&key)
            .cloned()
            .ok_or_else(|| QueryError::UnknownFormat(key))
    }

    /// Aliases of every registered writer, for the capabilities document
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .by_key
            .values()
            .map(|f| f.short_alias().to_string())
            .collect();
        aliases.sort();
        aliases.dedup();
        aliases
    }

    /// Every distinct registered writer, ordered by alias
    pub fn all(&self) -> Vec<Arc<dyn ResultFormatter>> {
        let mut seen = Vec::new();
        let mut out: Vec<Arc<dyn ResultFormatter>> = Vec::new();
        for formatter in self.by_key.values() {
            if !seen.contains(&formatter.short_alias()) {
                seen.push(formatter.short_alias());
                out.push(formatter.clone());
            }
        }
        out.sort_by_key(|f| f.short_alias());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_alias_and_mime() {
        let registry = FormatterRegistry::standard("votable");
        assert_eq!(
            registry.resolve(Some("csv")).unwrap().content_type(),
            "text/csv"
        );
        assert_eq!(
            registry
                .resolve(Some("application/x-votable+xml"))
                .unwrap()
                .short_alias(),
            "votable"
        );
        // Case-insensitive
        assert!(registry.resolve(Some("CSV")).is_ok());
    }

    #[test]
    fn test_default_applies_when_absent() {
        let registry = FormatterRegistry::standard("votable");
        assert_eq!(registry.resolve(None).unwrap().short_alias(), "votable");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let registry = FormatterRegistry::standard("votable");
        assert!(matches!(
            registry.resolve(Some("parquet")),
            Err(QueryError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_aliases_listed() {
        let registry = FormatterRegistry::standard("votable");
        let aliases = registry.aliases();
        assert!(aliases.contains(&"csv".to_string()));
        assert!(aliases.contains(&"votable".to_string()));
    }
}
