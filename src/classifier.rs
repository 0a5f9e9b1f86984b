//! Read-only gate for raw SQL.
//!
//! This is a lexical heuristic, not a parser. Keyword-like tokens inside
//! string literals or comments are treated like any other token, so some
//! harmless statements are rejected (`SHOW CREATE TABLE t`, or a literal
//! containing the word `delete`). Keep the behavior as is: clients rely on
//! exactly which statements pass.

use std::fmt;

/// Statements may only start with one of these keywords.
pub const ALLOWED_COMMANDS: [&str; 5] = ["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Any of these as a standalone word rejects the statement.
pub const FORBIDDEN_KEYWORDS: [&str; 21] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "RENAME", "REPLACE",
    "GRANT", "REVOKE", "LOCK", "UNLOCK", "CALL", "EXEC", "EXECUTE", "SET", "START", "BEGIN",
    "COMMIT", "ROLLBACK",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    NotReadOnly,
    ForbiddenKeyword(&'static str),
    MultipleStatements,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allowed = ALLOWED_COMMANDS.join(", ");
        match self {
            Rejection::Empty => write!(f, "Query is empty. Allowed commands: {allowed}"),
            Rejection::NotReadOnly => write!(
                f,
                "Only read-only queries are allowed. Allowed commands: {allowed}"
            ),
            Rejection::ForbiddenKeyword(keyword) => write!(
                f,
                "Query contains forbidden keyword: {keyword}. Allowed commands: {allowed}"
            ),
            Rejection::MultipleStatements => write!(
                f,
                "Multiple statements are not allowed. Allowed commands: {allowed}"
            ),
        }
    }
}

/// Decide whether `sql` may be executed.
pub fn classify(sql: &str) -> Verdict {
    let normalized = normalize(sql);
    if normalized.is_empty() {
        return Verdict::Rejected(Rejection::Empty);
    }

    let leading_ok = ALLOWED_COMMANDS.iter().any(|command| {
        normalized == *command
            || (normalized.starts_with(command) && normalized[command.len()..].starts_with(' '))
    });
    if !leading_ok {
        return Verdict::Rejected(Rejection::NotReadOnly);
    }

    let padded = format!(" {normalized} ");
    if let Some(keyword) = FORBIDDEN_KEYWORDS
        .iter()
        .find(|keyword| padded.contains(&format!(" {keyword} ")))
    {
        return Verdict::Rejected(Rejection::ForbiddenKeyword(*keyword));
    }

    if let Some(pos) = normalized.find(';') {
        if pos != normalized.len() - 1 {
            return Verdict::Rejected(Rejection::MultipleStatements);
        }
    }

    Verdict::Allowed
}

/// Every whitespace character becomes a space, then trim and uppercase.
fn normalize(sql: &str) -> String {
    sql.chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_uppercase()
}
