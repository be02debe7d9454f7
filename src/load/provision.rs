use std::time::Duration;
use tracing::{debug, info};

use crate::error::{with_timeout, EtlError, Result};
use crate::store::{Store, TableSchema};

/// Ensure the database and the all-string table described by `schema` exist.
///
/// Safe to call repeatedly. An existing table that lacks one of the wanted
/// columns is reported as a schema error rather than altered.
pub async fn ensure_table(
    store: &mut dyn Store,
    schema: &TableSchema,
    timeout: Duration,
) -> Result<()> {
    let dialect = store.dialect();
    let target = &schema.target;

    let create_db = dialect.create_database(&target.database);
    debug!(sql = %create_db, "ensuring database");
    with_timeout("create database", timeout, store.execute(&create_db)).await?;

    let create_table = schema.create_table(dialect);
    debug!(sql = %create_table, "ensuring table");
    with_timeout("create table", timeout, store.execute(&create_table)).await?;

    // CREATE TABLE IF NOT EXISTS is silent about a pre-existing table with other columns.
    let probe = format!("SELECT * FROM {} LIMIT 0", target.qualified(dialect));
    let existing = with_timeout("inspect table", timeout, store.query(&probe)).await?;
    let have: Vec<String> = existing
        .columns()
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let missing: Vec<&str> = schema
        .columns
        .iter()
        .filter(|c| !have.contains(&c.to_ascii_lowercase()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(EtlError::Schema(format!(
            "table {} already exists without columns [{}]",
            target,
            missing.join(", ")
        )));
    }

    info!(table = %target, columns = schema.columns.len(), "schema ensured");
    Ok(())
}
