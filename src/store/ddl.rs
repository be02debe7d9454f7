use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::error::{EtlError, Result};

/// Longest identifier MySQL accepts for databases, tables and columns.
pub const MAX_IDENT_LEN: usize = 64;

/// Every provisioned column is stored as a fixed-width string.
pub const STRING_COLUMN_TYPE: &str = "VARCHAR(255)";

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex should parse"));

/// Check `name` against the identifier allow-list.
pub fn validate_ident(kind: &str, name: &str) -> Result<()> {
    if name.len() > MAX_IDENT_LEN {
        return Err(EtlError::Schema(format!(
            "{} name `{}` is longer than {} characters",
            kind, name, MAX_IDENT_LEN
        )));
    }
    if !IDENT_RE.is_match(name) {
        return Err(EtlError::Schema(format!(
            "{} name `{}` is not a plain identifier ([A-Za-z_][A-Za-z0-9_]*)",
            kind, name
        )));
    }
    Ok(())
}

/// SQL flavour of a connected store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    DuckDb,
}

impl Dialect {
    /// Quote an identifier that already passed [`validate_ident`].
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident),
            Dialect::DuckDb => format!("\"{}\"", ident),
        }
    }

    /// MySQL databases map onto DuckDB schemas.
    pub fn create_database(&self, database: &str) -> String {
        match self {
            Dialect::MySql => format!("CREATE DATABASE IF NOT EXISTS {}", self.quote(database)),
            Dialect::DuckDb => format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote(database)),
        }
    }

    /// Make `database` the default for unqualified table names.
    pub fn use_database(&self, database: &str) -> String {
        match self {
            Dialect::MySql => format!("USE {}", self.quote(database)),
            Dialect::DuckDb => format!("SET schema = '{}'", database),
        }
    }
}

/// A table addressed as `database.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let t = Self {
            database: database.into(),
            table: table.into(),
        };
        validate_ident("database", &t.database)?;
        validate_ident("table", &t.table)?;
        Ok(t)
    }

    pub fn qualified(&self, dialect: Dialect) -> String {
        format!("{}.{}", dialect.quote(&self.database), dialect.quote(&self.table))
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// A string-typed table definition derived 1:1 from a column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub target: TableRef,
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Validate every column name and reject duplicates (case-insensitive, as both stores are).
    pub fn new(target: TableRef, columns: &[String]) -> Result<Self> {
        if columns.is_empty() {
            return Err(EtlError::Schema(format!("table {} has no columns", target)));
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for col in columns {
            validate_ident("column", col)?;
            if !seen.insert(col.to_ascii_lowercase()) {
                return Err(EtlError::Schema(format!(
                    "column `{}` appears more than once in {}",
                    col, target
                )));
            }
        }
        Ok(Self {
            target,
            columns: columns.to_vec(),
        })
    }

    pub fn create_table(&self, dialect: Dialect) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("    {} {}", dialect.quote(c), STRING_COLUMN_TYPE))
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.target.qualified(dialect),
            cols
        )
    }
}

/// Parameterized `INSERT` for the given columns.
pub fn insert_sql(dialect: Dialect, target: &TableRef, columns: &[&str]) -> String {
    let cols = columns
        .iter()
        .map(|c| dialect.quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        target.qualified(dialect),
        cols,
        placeholders
    )
}
