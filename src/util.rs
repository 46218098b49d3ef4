/// Quote a SQL identifier, doubling any embedded double-quotes.
pub fn qi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a SQL string literal's body, doubling any embedded single-quotes.
/// Callers still need to wrap the result in `'...'`.
pub fn esc(s: &str) -> String {
    s.replace('\'', "''")
}

/// Quote-and-wrap as a SQL string literal.
pub fn ql(s: &str) -> String {
    format!("'{}'", esc(s))
}
