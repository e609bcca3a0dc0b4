//! Published table metadata

use serde::{Deserialize, Serialize};

use crate::query::cursor::ColumnType;

/// One published column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub datatype: ColumnType,
    pub description: Option<String>,
    pub unit: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
        Self {
            name: name.into(),
            datatype,
            description: None,
            unit: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// One published table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub description: Option<String>,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            description: None,
            columns: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Schema-qualified name as it appears in queries
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Registry of queryable tables
pub trait MetadataProvider: Send + Sync {
    fn list_tables(&self) -> Vec<TableDef>;
}

/// Fixed table set assembled at service start
pub struct StaticMetadata {
    tables: Vec<TableDef>,
}

impl StaticMetadata {
    pub fn new(tables: Vec<TableDef>) -> Self {
        Self { tables }
    }

    pub fn empty() -> Self {
        Self { tables: Vec::new() }
    }
}

impl MetadataProvider for StaticMetadata {
    fn list_tables(&self) -> Vec<TableDef> {
        self.tables.clone()
    }
}
