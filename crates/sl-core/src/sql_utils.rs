//! SQL identifier and literal quoting utilities
//!
//! Every statement the loader builds goes through these helpers so table,
//! column, and URI values never reach the warehouse unquoted.

/// Quote a SQL identifier, doubling embedded double quotes.
///
/// # Examples
/// ```
/// use sl_core::sql_utils::quote_ident;
/// assert_eq!(quote_ident("users"), r#""users""#);
/// assert_eq!(quote_ident(r#"my"table"#), r#""my""table""#);
/// ```
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
///
/// # Examples
/// ```
/// use sl_core::sql_utils::quote_literal;
/// assert_eq!(quote_literal("s3://bucket/log_data"), "'s3://bucket/log_data'");
/// assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
/// ```
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote each name and join with `, ` for column lists.
pub fn quoted_list<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split a potentially schema-qualified table name into (schema, table).
///
/// Uses the last `.` as the separator and defaults the schema to `main`.
pub fn split_qualified_name(name: &str) -> (&str, &str) {
    if let Some(pos) = name.rfind('.') {
        (&name[..pos], &name[pos + 1..])
    } else {
        ("main", name)
    }
}
