//! Classification of replayed statements.

use std::fmt;

/// Result of applying one statement to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Any other statement kind, a skipped statement, or a failed one.
    Other,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Deleted => "deleted",
            ApplyOutcome::Other => "other",
        };
        f.write_str(s)
    }
}

/// Statement kind recognised from the leading keywords of the SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    /// `DROP DATABASE [IF EXISTS] <name>`, carrying the unquoted name.
    DropDatabase(String),
    Other,
}

impl StatementKind {
    pub fn classify(sql: &str) -> Self {
        let mut words = sql.split_whitespace();
        let Some(first) = words.next() else {
            return StatementKind::Other;
        };

        if first.eq_ignore_ascii_case("insert") {
            StatementKind::Insert
        } else if first.eq_ignore_ascii_case("update") {
            StatementKind::Update
        } else if first.eq_ignore_ascii_case("delete") {
            StatementKind::Delete
        } else if first.eq_ignore_ascii_case("drop")
            && words
                .next()
                .is_some_and(|w| w.eq_ignore_ascii_case("database"))
        {
            let mut name = words.next();
            if name.is_some_and(|w| w.eq_ignore_ascii_case("if")) {
                // IF EXISTS
                name = words.nth(1);
            }
            match name {
                Some(name) => StatementKind::DropDatabase(unquote_ident(name)),
                None => StatementKind::Other,
            }
        } else {
            StatementKind::Other
        }
    }

    /// Outcome reported after the statement ran successfully.
    pub fn outcome(&self) -> ApplyOutcome {
        match self {
            StatementKind::Insert => ApplyOutcome::Inserted,
            StatementKind::Update => ApplyOutcome::Updated,
            StatementKind::Delete => ApplyOutcome::Deleted,
            StatementKind::DropDatabase(_) | StatementKind::Other => ApplyOutcome::Other,
        }
    }
}

/// Strip a trailing semicolon and identifier quoting; unquoted names fold to lower case.
fn unquote_ident(raw: &str) -> String {
    let raw = raw.trim_end_matches(';');
    match raw
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => raw.to_ascii_lowercase(),
    }
}
