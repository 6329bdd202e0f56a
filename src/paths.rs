//! Database path resolution and ATTACH/DETACH statement construction.

use std::path::{Path, PathBuf};

/// Joins a database file name onto its location directory.
pub fn resolve_db_path(location: impl AsRef<Path>, file_name: &str) -> PathBuf {
    location.as_ref().join(file_name)
}

pub(crate) fn attach_statement(path: &Path, alias: &str) -> String {
    format!(
        "ATTACH DATABASE {} AS {}",
        quote_literal(&path.to_string_lossy()),
        quote_identifier(alias)
    )
}

pub(crate) fn detach_statement(alias: &str) -> String {
    format!("DETACH DATABASE {}", quote_identifier(alias))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
