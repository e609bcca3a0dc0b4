//! ADQL parsing contract and the reference parser

use once_cell::sync::Lazy;
use regex::Regex;

use crate::query::QueryError;

/// Outcome of a successful parse
///
/// The reference parser keeps the query close to its textual form; a
/// full grammar implementation can carry its tree in `body` serialized
/// however it likes, as long as its paired translator understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    /// The query exactly as submitted
    pub text: String,

    /// The query with any ADQL TOP clause removed
    pub body: String,

    /// Row limit carried by the query itself (ADQL TOP)
    pub top: Option<i64>,
}

/// Parser collaborator seam
pub trait QueryParser: Send + Sync {
    /// Parse the query text, reporting the first syntactic error with
    /// its character position
    fn parse(&self, query: &str) -> Result<ParsedQuery, QueryError>;
}

static TOP_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*select\s+top\s+(\d+)\s+").expect("valid regex"));

/// Lightweight syntactic validator for ADQL SELECT statements
///
/// Checks statement shape, quote and parenthesis balance, and extracts
/// the TOP clause. Semantic validation against the table metadata is
/// left to the database itself.
pub struct AdqlParser;

impl AdqlParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AdqlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryParser for AdqlParser {
    fn parse(&self, query: &str) -> Result<ParsedQuery, QueryError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(QueryError::Parse {
                position: 0,
                message: "Empty query".to_string(),
            });
        }

        let lowered = trimmed.to_ascii_lowercase();
        if !lowered.starts_with("select") {
            return Err(QueryError::Parse {
                position: 0,
                message: "Only SELECT statements are accepted".to_string(),
            });
        }

        check_balance(query)?;

        let (body, top) = match TOP_CLAUSE.captures(trimmed) {
            Some(caps) => {
                let n: i64 = caps[1].parse().map_err(|_| QueryError::Parse {
                    position: caps.get(1).map(|m| m.start()).unwrap_or(0),
                    message: "TOP value out of range".to_string(),
                })?;
                let rest = &trimmed[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
                (format!("SELECT {}", rest), Some(n))
            }
            None => (trimmed.to_string(), None),
        };

        Ok(ParsedQuery {
            text: query.to_string(),
            body,
            top,
        })
    }
}

/// Verify quotes and parentheses are balanced and no second statement
/// is smuggled in behind a semicolon
fn check_balance(query: &str) -> Result<(), QueryError> {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut in_ident = false;
    let mut string_start = 0;
    let mut ident_start = 0;

    let mut chars = query.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        if in_string {
            if c == '\'' {
                // Doubled quote is an escaped quote
                if matches!(chars.peek(), Some((_, '\''))) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        if in_ident {
            if c == '"' {
                in_ident = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                string_start = pos;
            }
            '"' => {
                in_ident = true;
                ident_start = pos;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(QueryError::Parse {
                        position: pos,
                        message: "Unbalanced closing parenthesis".to_string(),
                    });
                }
            }
            ';' => {
                // A trailing semicolon is tolerated; anything after it
                // is not
                if query[pos + 1..].trim().is_empty() {
                    break;
                }
                return Err(QueryError::Parse {
                    position: pos,
                    message: "Multiple statements are not accepted".to_string(),
                });
            }
            _ => {}
        }
    }

    if in_string {
        return Err(QueryError::Parse {
            position: string_start,
            message: "Unterminated string literal".to_string(),
        });
    }
    if in_ident {
        return Err(QueryError::Parse {
            position: ident_start,
            message: "Unterminated quoted identifier".to_string(),
        });
    }
    if depth != 0 {
        return Err(QueryError::Parse {
            position: query.len(),
            message: "Unbalanced opening parenthesis".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_select() {
        let parsed = AdqlParser::new().parse("SELECT a, b FROM stars").unwrap();
        assert_eq!(parsed.top, None);
        assert_eq!(parsed.body, "SELECT a, b FROM stars");
    }

    #[test]
    fn test_top_extraction() {
        let parsed = AdqlParser::new()
            .parse("SELECT TOP 3 * FROM stars WHERE mag < 10")
            .unwrap();
        assert_eq!(parsed.top, Some(3));
        assert_eq!(parsed.body, "SELECT * FROM stars WHERE mag < 10");
        // Original text preserved
        assert!(parsed.text.contains("TOP 3"));
    }

    #[test]
    fn test_empty_query_rejected() {
        let err = AdqlParser::new().parse("   ").unwrap_err();
        assert!(matches!(err, QueryError::Parse { position: 0, .. }));
    }

    #[test]
    fn test_non_select_rejected() {
        let err = AdqlParser::new().parse("DROP TABLE stars").unwrap_err();
        assert!(matches!(err, QueryError::Parse { .. }));
    }

    #[test]
    fn test_unterminated_string_position() {
        let err = AdqlParser::new()
            .parse("SELECT * FROM t WHERE name = 'orion")
            .unwrap_err();
        match err {
            QueryError::Parse { position, .. } => assert_eq!(position, 29),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        assert!(AdqlParser::new()
            .parse("SELECT * FROM t WHERE name = 'o''rion'")
            .is_ok());
    }

    #[test]
    fn test_unbalanced_parenthesis() {
        assert!(AdqlParser::new()
            .parse("SELECT * FROM t WHERE (a > 1")
            .is_err());
        assert!(AdqlParser::new()
            .parse("SELECT * FROM t WHERE a > 1)")
            .is_err());
    }

    #[test]
    fn test_second_statement_rejected() {
        let err = AdqlParser::new()
            .parse("SELECT 1; DELETE FROM stars")
            .unwrap_err();
        assert!(matches!(err, QueryError::Parse { .. }));
        // A lone trailing semicolon is fine
        assert!(AdqlParser::new().parse("SELECT 1;").is_ok());
    }

    #[test]
    fn test_parenthesis_inside_string_ignored() {
        assert!(AdqlParser::new()
            .parse("SELECT * FROM t WHERE name = '(unclosed'")
            .is_ok());
    }
}
