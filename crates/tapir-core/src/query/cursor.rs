//! Result rows flowing from the database to a formatter

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::query::QueryError;

/// Column datatype as exposed to formatters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Short,
    Int,
    Long,
    Float,
    Double,
    Boolean,
    Char,
    Timestamp,
}

impl ColumnType {
    /// VOTable datatype name
    pub fn votable_name(&self) -> &'static str {
        match self {
            ColumnType::Short => "short",
            ColumnType::Int => "int",
            ColumnType::Long => "long",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::Char => "char",
            ColumnType::Timestamp => "char",
        }
    }
}

/// Descriptor of one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub datatype: ColumnType,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
        Self {
            name: name.into(),
            datatype,
        }
    }
}

/// One cell of a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Int(i64),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Serialized form shared by the text-based writers
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Text(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// Streaming access to a query's result rows
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[ColumnDesc];

    /// Next row, or `None` when the cursor is drained
    async fn next_row(&mut self) -> Result<Option<Vec<FieldValue>>, QueryError>;

    /// Total row count when known up front
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Cursor over rows already held in memory
///
/// The executed SQL always carries an injected row limit, so result sets
/// are bounded and buffering them is acceptable.
pub struct MemoryCursor {
    columns: Vec<ColumnDesc>,
    rows: VecDeque<Vec<FieldValue>>,
    total: u64,
}

impl MemoryCursor {
    pub fn new(columns: Vec<ColumnDesc>, rows: Vec<Vec<FieldValue>>) -> Self {
        let total = rows.len() as u64;
        Self {
            columns,
            rows: rows.into(),
            total,
        }
    }

    pub fn empty(columns: Vec<ColumnDesc>) -> Self {
        Self::new(columns, Vec::new())
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<FieldValue>>, QueryError> {
        Ok(self.rows.pop_front())
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cursor_drains_in_order() {
        let mut cursor = MemoryCursor::new(
            vec![ColumnDesc::new("n", ColumnType::Long)],
            vec![
                vec![FieldValue::Int(1)],
                vec![FieldValue::Int(2)],
                vec![FieldValue::Int(3)],
            ],
        );
        assert_eq!(cursor.size_hint(), Some(3));
        let mut seen = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            seen.push(row[0].clone());
        }
        assert_eq!(
            seen,
            vec![FieldValue::Int(1), FieldValue::Int(2), FieldValue::Int(3)]
        );
    }

    #[test]
    fn test_render_values() {
        assert_eq!(FieldValue::Null.render(), "");
        assert_eq!(FieldValue::Int(-7).render(), "-7");
        assert_eq!(FieldValue::Text("x y".into()).render(), "x y");
        assert_eq!(FieldValue::Bool(true).render(), "true");
    }
}
