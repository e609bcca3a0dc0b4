//! CSV result writer

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::query::cursor::RowCursor;
use crate::query::format::{ResultFormatter, WriteContext};
use crate::query::sink::ChunkedWriter;
use crate::query::QueryError;

const CANCEL_CHECK_EVERY: u64 = 256;

/// Writes RFC 4180 CSV with a header row
pub struct CsvFormatter;

impl CsvFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_record(fields: &[String]) -> Result<Vec<u8>, QueryError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| QueryError::Write(format!("CSV encoding failed: {}", e)))?;
    writer
        .into_inner()
        .map_err(|e| QueryError::Write(format!("CSV encoding failed: {}", e)))
}

#[async_trait]
impl ResultFormatter for CsvFormatter {
    fn content_type(&self) -> &'static str {
        "text/csv"
    }

    fn short_alias(&self) -> &'static str {
        "csv"
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }

    async fn write(
        &self,
        cursor: &mut dyn RowCursor,
        out: &mut ChunkedWriter,
        _ctx: &WriteContext,
        cancel: &CancellationToken,
    ) -> Result<u64, QueryError> {
        let header: Vec<String> = cursor.columns().iter().map(|c| c.name.clone()).collect();
        if !header.is_empty() {
            out.write(&encode_record(&header)?).await?;
        }

        let mut rows: u64 = 0;
        while let Some(row) = cursor.next_row().await? {
            let fields: Vec<String> = row.iter().map(|v| v.render()).collect();
            out.write(&encode_record(&fields)?).await?;
            rows += 1;
            if rows % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(QueryError::Interrupted);
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cursor::{ColumnDesc, ColumnType, FieldValue, MemoryCursor};
    use crate::query::sink::tests_support::BufferSink;

    #[tokio::test]
    async fn test_header_and_quoting() {
        let mut cursor = MemoryCursor::new(
            vec![
                ColumnDesc::new("name", ColumnType::Char),
                ColumnDesc::new("n", ColumnType::Long),
            ],
            vec![
                vec![FieldValue::Text("plain".into()), FieldValue::Int(1)],
                vec![FieldValue::Text("needs,quotes".into()), FieldValue::Int(2)],
                vec![FieldValue::Null, FieldValue::Int(3)],
            ],
        );

        let (sink, data, _) = BufferSink::new();
        let mut out = ChunkedWriter::new(Box::new(sink));
        let rows = CsvFormatter::new()
            .write(
                &mut cursor,
                &mut out,
                &WriteContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        out.finish().await.unwrap();

        assert_eq!(rows, 3);
        let body = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "name,n");
        assert_eq!(lines[1], "plain,1");
        assert_eq!(lines[2], "\"needs,quotes\",2");
        assert_eq!(lines[3], ",3");
    }

    #[tokio::test]
    async fn test_empty_result_is_header_only() {
        let mut cursor =
            MemoryCursor::empty(vec![ColumnDesc::new("a", ColumnType::Int)]);
        let (sink, data, _) = BufferSink::new();
        let mut out = ChunkedWriter::new(Box::new(sink));
        let rows = CsvFormatter::new()
            .write(
                &mut cursor,
                &mut out,
                &WriteContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        out.finish().await.unwrap();

        assert_eq!(rows, 0);
        let body = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        assert_eq!(body, "a\n");
    }
}
