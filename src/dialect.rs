//! Dialect Translator
//!
//! Stored report SQL always uses `?` as its positional placeholder. Engines
//! other than MySQL need their own positional syntax, so the query is
//! rewritten before execution.

use crate::error::{EngineError, Result};
use std::fmt;
use std::str::FromStr;

/// Relational engines a data source can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Mysql,
    Postgres,
    Oracle,
    Mssql,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Oracle => "oracle",
            Self::Mssql => "mssql",
        }
    }

    /// Positional parameter marker for the `n`th placeholder (1-based).
    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Mysql => "?".to_string(),
            Self::Postgres => format!("${n}"),
            Self::Oracle => format!(":p{n}"),
            Self::Mssql => format!("@p{n}"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mysql" => Ok(Self::Mysql),
            "postgres" => Ok(Self::Postgres),
            "oracle" => Ok(Self::Oracle),
            "mssql" => Ok(Self::Mssql),
            other => Err(EngineError::Connection(format!(
                "unsupported database type: {other}"
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrite every `?` outside single-quoted literals into the engine's
/// positional syntax, numbering from 1. MySQL queries are returned as-is.
///
/// A doubled quote (`''`) inside a literal is an escaped quote and does not
/// end the literal.
pub fn translate_placeholders(query: &str, engine: EngineKind) -> String {
    if engine == EngineKind::Mysql {
        return query.to_string();
    }

    let mut out = String::with_capacity(query.len() + 8);
    let mut chars = query.chars().peekable();
    let mut in_string = false;
    let mut count = 1;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("''");
                    continue;
                }
                in_string = !in_string;
                out.push('\'');
            }
            '?' if !in_string => {
                out.push_str(&engine.placeholder(count));
                count += 1;
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EngineKind; 4] = [
        EngineKind::Mysql,
        EngineKind::Postgres,
        EngineKind::Oracle,
        EngineKind::Mssql,
    ];

    #[test]
    fn test_mysql_is_identity() {
        for query in [
            "SELECT * FROM users WHERE id = ?",
            "SELECT '?', ? FROM t WHERE a = 'it''s ?'",
            "",
            "?'",
        ] {
            assert_eq!(translate_placeholders(query, EngineKind::Mysql), query);
        }
    }

    #[test]
    fn test_engine_specific_markers() {
        let query = "SELECT * FROM users WHERE id = ?";
        assert_eq!(
            translate_placeholders(query, EngineKind::Postgres),
            "SELECT * FROM users WHERE id = $1"
        );
        assert_eq!(
            translate_placeholders(query, EngineKind::Oracle),
            "SELECT * FROM users WHERE id = :p1"
        );
        assert_eq!(
            translate_placeholders(query, EngineKind::Mssql),
            "SELECT * FROM users WHERE id = @p1"
        );
    }

    #[test]
    fn test_numbering_increments() {
        assert_eq!(
            translate_placeholders(
                "SELECT * FROM users WHERE id = ? AND status = ? OR x IN (?,?)",
                EngineKind::Postgres
            ),
            "SELECT * FROM users WHERE id = $1 AND status = $2 OR x IN ($3,$4)"
        );
    }

    #[test]
    fn test_quoted_question_marks_untouched() {
        assert_eq!(
            translate_placeholders(
                "SELECT * FROM users WHERE name = 'John?' AND id = ?",
                EngineKind::Postgres
            ),
            "SELECT * FROM users WHERE name = 'John?' AND id = $1"
        );
        assert_eq!(
            translate_placeholders(
                "SELECT * FROM users WHERE name = 'O''Reilly?' AND id = ?",
                EngineKind::Oracle
            ),
            "SELECT * FROM users WHERE name = 'O''Reilly?' AND id = :p1"
        );
    }

    #[test]
    fn test_placeholder_count_matches_unquoted_marks() {
        let query = "SELECT ?, '?', 'a''?', ? FROM t WHERE c = '' AND d = ?";
        for engine in ALL.into_iter().filter(|e| *e != EngineKind::Mysql) {
            let translated = translate_placeholders(query, engine);
            assert!(!translated.contains(&engine.placeholder(4)));
            for n in 1..=3 {
                assert_eq!(translated.matches(&engine.placeholder(n)).count(), 1);
            }
        }
    }

    #[test]
    fn test_non_ascii_text_survives() {
        assert_eq!(
            translate_placeholders("SELECT 'café?' , naïve FROM t WHERE x = ?", EngineKind::Mssql),
            "SELECT 'café?' , naïve FROM t WHERE x = @p1"
        );
    }

    #[test]
    fn test_engine_kind_parsing() {
        for engine in ALL {
            assert_eq!(engine.as_str().parse::<EngineKind>().unwrap(), engine);
        }
        let err = "sqlite".parse::<EngineKind>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported database type: sqlite");
    }
}
