use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{with_timeout, EtlError, Result};
use crate::record::RecordSet;
use crate::store::{ddl::insert_sql, Store, TableRef};

/// What a failing row does to the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RowErrorPolicy {
    /// Stop at the first failing row.
    #[default]
    Abort,
    /// Record the failure and keep going.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// 0-based index into the record set.
    pub row: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertReport {
    pub target: TableRef,
    pub attempted: usize,
    pub inserted: u64,
    pub failures: Vec<RowFailure>,
    pub elapsed: Duration,
}

impl InsertReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Insert every row of `set` into `target`, in order, one statement per row.
/// Missing cells are bound as SQL NULL.
pub async fn bulk_insert(
    store: &mut dyn Store,
    set: &RecordSet,
    target: &TableRef,
    policy: RowErrorPolicy,
    timeout: Duration,
) -> Result<InsertReport> {
    let start = Instant::now();
    let columns: Vec<&str> = set.columns().iter().map(String::as_str).collect();
    let sql = insert_sql(store.dialect(), target, &columns);
    debug!(sql = %sql, rows = set.len(), "bulk insert");

    let mut inserted = 0u64;
    let mut failures = Vec::new();
    for (idx, row) in set.rows().iter().enumerate() {
        let values: Vec<Option<&str>> = row.iter().map(|c| c.as_deref()).collect();
        match with_timeout("insert row", timeout, store.execute_params(&sql, &values)).await {
            Ok(()) => inserted += 1,
            Err(e) if policy == RowErrorPolicy::Skip => {
                warn!(row = idx, error = %e, "row insert failed, skipping");
                failures.push(RowFailure {
                    row: idx,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                return Err(EtlError::Insert {
                    row: idx,
                    inserted,
                    message: e.to_string(),
                })
            }
        }
    }

    let report = InsertReport {
        target: target.clone(),
        attempted: set.len(),
        inserted,
        failures,
        elapsed: start.elapsed(),
    };
    info!(
        table = %target,
        inserted = report.inserted,
        failed = report.failures.len(),
        elapsed = ?report.elapsed,
        "bulk insert done"
    );
    Ok(report)
}
