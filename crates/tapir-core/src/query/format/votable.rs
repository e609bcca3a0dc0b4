//! VOTable result writer

use async_trait::async_trait;
use quick_xml::escape::escape;
use tokio_util::sync::CancellationToken;

use crate::query::cursor::{FieldValue, RowCursor};
use crate::query::format::{ResultFormatter, WriteContext};
use crate::query::sink::ChunkedWriter;
use crate::query::QueryError;

const CANCEL_CHECK_EVERY: u64 = 256;

/// Writes TABLEDATA-serialized VOTable 1.3
pub struct VoTableFormatter;

impl VoTableFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VoTableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultFormatter for VoTableFormatter {
    fn content_type(&self) -> &'static str {
        "application/x-votable+xml"
    }

    fn short_alias(&self) -> &'static str {
        "votable"
    }

    fn file_extension(&self) -> &'static str {
        "xml"
    }

    async fn write(
        &self,
        cursor: &mut dyn RowCursor,
        out: &mut ChunkedWriter,
        ctx: &WriteContext,
        cancel: &CancellationToken,
    ) -> Result<u64, QueryError> {
        out.write_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")
            .await?;
        out.write_str(
            "<VOTABLE version=\"1.3\" xmlns=\"http://www.ivoa.net/xml/VOTable/v1.3\">\n",
        )
        .await?;
        out.write_str("<RESOURCE type=\"results\">\n").await?;
        out.write_str("<INFO name=\"QUERY_STATUS\" value=\"OK\"/>\n")
            .await?;
        out.write_str("<TABLE>\n").await?;

        for col in cursor.columns() {
            let field = format!(
                "<FIELD name=\"{}\" datatype=\"{}\"{}/>\n",
                escape(&col.name),
                col.datatype.votable_name(),
                // Character columns carry a variable arraysize
                if col.datatype.votable_name() == "char" {
                    " arraysize=\"*\""
                } else {
                    ""
                }
            );
            out.write_str(&field).await?;
        }

        out.write_str("<DATA>\n<TABLEDATA>\n").await?;

        let mut rows: u64 = 0;
        while let Some(row) = cursor.next_row().await? {
            out.write_str("<TR>").await?;
            for value in &row {
                match value {
                    FieldValue::Null => out.write_str("<TD/>").await?,
                    other => {
                        out.write_str("<TD>").await?;
                        out.write_str(&escape(&other.render())).await?;
                        out.write_str("</TD>").await?;
                    }
                }
            }
            out.write_str("</TR>\n").await?;
            rows += 1;
            if rows % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(QueryError::Interrupted);
            }
        }

        out.write_str("</TABLEDATA>\n</DATA>\n</TABLE>\n").await?;
        if ctx.overflow {
            out.write_str("<INFO name=\"QUERY_STATUS\" value=\"OVERFLOW\"/>\n")
                .await?;
        }
        out.write_str("</RESOURCE>\n</VOTABLE>\n").await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cursor::{ColumnDesc, ColumnType, MemoryCursor};
    use crate::query::sink::tests_support::BufferSink;

    async fn render(cursor: &mut dyn RowCursor, overflow: bool) -> String {
        let (sink, data, _) = BufferSink::new();
        let mut out = ChunkedWriter::new(Box::new(sink));
        let rows = VoTableFormatter::new()
            .write(
                cursor,
                &mut out,
                &WriteContext { overflow },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        out.finish().await.unwrap();
        let body = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        assert!(rows <= u64::MAX);
        body
    }

    #[tokio::test]
    async fn test_fields_and_rows_serialized() {
        let mut cursor = MemoryCursor::new(
            vec![
                ColumnDesc::new("name", ColumnType::Char),
                ColumnDesc::new("mag", ColumnType::Double),
            ],
            vec![
                vec![FieldValue::Text("Vega".into()), FieldValue::Double(0.03)],
                vec![FieldValue::Null, FieldValue::Double(1.25)],
            ],
        );
        let body = render(&mut cursor, false).await;

        assert!(body.contains("<FIELD name=\"name\" datatype=\"char\" arraysize=\"*\"/>"));
        assert!(body.contains("<FIELD name=\"mag\" datatype=\"double\"/>"));
        assert!(body.contains("<TD>Vega</TD>"));
        assert!(body.contains("<TD/>"));
        assert!(body.contains("value=\"OK\""));
        assert!(!body.contains("OVERFLOW"));
    }

    #[tokio::test]
    async fn test_overflow_indicator_emitted() {
        let mut cursor = MemoryCursor::new(
            vec![ColumnDesc::new("n", ColumnType::Long)],
            vec![vec![FieldValue::Int(1)]],
        );
        let body = render(&mut cursor, true).await;
        assert!(body.contains("value=\"OVERFLOW\""));
    }

    #[tokio::test]
    async fn test_xml_special_characters_escaped() {
        let mut cursor = MemoryCursor::new(
            vec![ColumnDesc::new("s", ColumnType::Char)],
            vec![vec![FieldValue::Text("a<b & c>d".into())]],
        );
        let body = render(&mut cursor, false).await;
        assert!(body.contains("a&lt;b &amp; c&gt;d"));
    }
}
