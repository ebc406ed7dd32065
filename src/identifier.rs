//! Collection and field names end up verbatim in DDL and DML, so they have to
//! pass a strict allow-list before they're ever interpolated into SQL.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Prefix of the temporary tables used by shadow-table rebuilds
pub const SHADOW_PREFIX: &str = "_shadow_";

/// Internal catalog tables
pub const CATALOG_TABLES: &[&str] = &["_collections", "_fields"];

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid");
}

// https://www.sqlite.org/lang_keywords.html
const SQLITE_KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS",
    "ASC", "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE",
    "CASE", "CAST", "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT",
    "CREATE", "CROSS", "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP",
    "DATABASE", "DEFAULT", "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH",
    "DISTINCT", "DO", "DROP", "EACH", "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE",
    "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL", "FILTER", "FIRST", "FOLLOWING", "FOR",
    "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB", "GROUP", "GROUPS", "HAVING", "IF",
    "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED", "INITIALLY", "INNER", "INSERT",
    "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "KEY", "LAST", "LEFT", "LIKE",
    "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT", "NOTHING", "NOTNULL",
    "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS", "OUTER", "OVER",
    "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE", "RANGE",
    "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE",
    "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT",
    "SET", "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER",
    "UNBOUNDED", "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW",
    "VIRTUAL", "WHEN", "WHERE", "WINDOW", "WITH", "WITHOUT",
];

// Implicit row id aliases, which every table has
const ROWID_ALIASES: &[&str] = &["ROWID", "OID", "_ROWID_"];

fn invalid(name: &str, reason: &str) -> Error {
    Error::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Accept `^[A-Za-z_][A-Za-z0-9_]*$` names that aren't SQLite keywords
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, "must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(name, "must be at most 64 characters long"));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(invalid(
            name,
            "must start with a letter or underscore and contain only letters, digits and underscores",
        ));
    }

    let upper = name.to_ascii_uppercase();
    if SQLITE_KEYWORDS.contains(&upper.as_str()) {
        return Err(invalid(name, "is a reserved SQL keyword"));
    }
    if ROWID_ALIASES.contains(&upper.as_str()) {
        return Err(invalid(name, "is reserved for the implicit row id"));
    }

    Ok(())
}

/// Table names additionally can't shadow the catalog or engine-internal tables
pub fn validate_collection_name(name: &str) -> Result<()> {
    validate_identifier(name)?;

    let lower = name.to_ascii_lowercase();
    if CATALOG_TABLES.contains(&lower.as_str()) {
        return Err(invalid(name, "is reserved for the catalog"));
    }
    if lower.starts_with("sqlite_") || lower.starts_with(SHADOW_PREFIX) {
        return Err(invalid(name, "uses a prefix reserved for internal tables"));
    }

    Ok(())
}

/// Double-quote an identifier for interpolation. Callers validate first; any
/// embedded quote is doubled regardless.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("posts")]
    #[case("_private")]
    #[case("Field_2")]
    #[case("views")]
    fn test_valid_identifiers(#[case] name: &str) {
        assert!(validate_identifier(name).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("2fast")]
    #[case("drop table")]
    #[case("posts;--")]
    #[case("na\"me")]
    #[case("select")]
    #[case("Order")]
    #[case("rowid")]
    #[case("ünïcode")]
    fn test_invalid_identifiers(#[case] name: &str) {
        assert!(matches!(
            validate_identifier(name),
            Err(Error::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_identifier_length_limit() {
        assert!(validate_identifier(&"a".repeat(64)).is_ok());
        assert!(validate_identifier(&"a".repeat(65)).is_err());
    }

    #[rstest]
    #[case("_collections")]
    #[case("_FIELDS")]
    #[case("sqlite_master")]
    #[case("_shadow_posts")]
    fn test_reserved_collection_names(#[case] name: &str) {
        assert!(validate_identifier(name).is_ok());
        assert!(validate_collection_name(name).is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("posts"), "\"posts\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
