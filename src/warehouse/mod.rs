pub mod bigquery;

pub use bigquery::BigQueryWarehouse;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EtlError, Result};
use crate::record::RecordSet;

/// A query source the extractor can materialize results from.
#[async_trait]
pub trait Warehouse: Send {
    /// Run `sql` and return at most `row_limit` rows.
    async fn fetch(&mut self, sql: &str, row_limit: u64) -> Result<RecordSet>;
}

static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+){0,2}$").expect("table regex should parse")
});

static COLUMN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("column regex should parse"));

/// The bounded extraction query: a table, an inclusive date window and a row cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseQuery {
    pub table: String,
    pub date_column: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub row_limit: u64,
}

impl WarehouseQuery {
    pub fn validate(&self) -> Result<()> {
        if !TABLE_RE.is_match(&self.table) {
            return Err(EtlError::Config(format!(
                "warehouse table `{}` must look like project.dataset.table",
                self.table
            )));
        }
        if !COLUMN_RE.is_match(&self.date_column) {
            return Err(EtlError::Config(format!(
                "date column `{}` is not a plain identifier",
                self.date_column
            )));
        }
        if self.start > self.end {
            return Err(EtlError::Config(format!(
                "start date {} is after end date {}",
                self.start, self.end
            )));
        }
        if self.row_limit == 0 {
            return Err(EtlError::Config("row limit must be positive".into()));
        }
        Ok(())
    }

    /// Standard SQL text; both date bounds are inclusive.
    pub fn to_sql(&self) -> Result<String> {
        self.validate()?;
        Ok(format!(
            "SELECT\n    *\nFROM\n    `{}`\nWHERE\n    {} BETWEEN '{}' AND '{}'\nLIMIT {}",
            self.table,
            self.date_column,
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            self.row_limit
        ))
    }
}
