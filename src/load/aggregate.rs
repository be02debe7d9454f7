use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::provision::ensure_table;
use crate::error::{with_timeout, EtlError, Result};
use crate::record::RecordSet;
use crate::store::{
    ddl::{insert_sql, validate_ident},
    Store, TableRef, TableSchema,
};

/// Stands for the loaded table in an aggregation query.
pub const SOURCE_TABLE_PLACEHOLDER: &str = "{table}";

/// Daily mean throughput and min-RTT per location and provider.
pub const DEFAULT_AGGREGATION_QUERY: &str = "SELECT
    date AS Day,
    AVG(CAST(MeanThroughputMbps AS DOUBLE)) AS Throughput,
    AVG(CAST(MinRTT AS DOUBLE)) AS AVGMinRTT,
    CountryName,
    city,
    Latitude, Longitude,
    ASName AS ISP
FROM
    {table}
GROUP BY
    Day,
    city,
    CountryName,
    Latitude, Longitude,
    ASName";

/// Substitute the loaded table's name for every `{table}` in `query`.
pub fn bind_source_table(query: &str, table: &str) -> Result<String> {
    validate_ident("table", table)?;
    Ok(query.replace(SOURCE_TABLE_PLACEHOLDER, table))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub target: TableRef,
    pub columns: Vec<String>,
    pub result_rows: usize,
    pub inserted: u64,
    /// Rows whose every field was null; nothing is written for them.
    pub skipped_empty: u64,
    pub elapsed: Duration,
}

/// Run `query` with `source_database` as the default database, then make sure
/// `target` exists with a string column per result column.
pub async fn prepare_aggregate(
    store: &mut dyn Store,
    source_database: &str,
    query: &str,
    target: &TableRef,
    timeout: Duration,
) -> Result<RecordSet> {
    validate_ident("database", source_database)?;
    let use_db = store.dialect().use_database(source_database);
    with_timeout("select database", timeout, store.execute(&use_db)).await?;

    debug!(sql = %query, "running aggregation");
    let result = with_timeout("aggregation query", timeout, store.query(query)).await?;
    info!(rows = result.len(), columns = result.num_columns(), "aggregation materialized");

    let schema = TableSchema::new(target.clone(), result.columns())?;
    ensure_table(store, &schema, timeout).await?;
    Ok(result)
}

/// Write each row of `result` into `target` with only its non-null fields; a
/// null field is left out of the INSERT column list instead of being bound as NULL.
pub async fn store_aggregate(
    store: &mut dyn Store,
    result: &RecordSet,
    target: &TableRef,
    timeout: Duration,
) -> Result<AggregateReport> {
    let start = Instant::now();
    let dialect = store.dialect();

    let mut inserted = 0u64;
    let mut skipped_empty = 0u64;
    for idx in 0..result.len() {
        let fields = result.non_null_fields(idx);
        if fields.is_empty() {
            warn!(row = idx, "aggregated row has no non-null fields, skipping");
            skipped_empty += 1;
            continue;
        }
        let (cols, values): (Vec<&str>, Vec<Option<&str>>) =
            fields.into_iter().map(|(c, v)| (c, Some(v))).unzip();
        let sql = insert_sql(dialect, target, &cols);
        with_timeout("insert aggregated row", timeout, store.execute_params(&sql, &values))
            .await
            .map_err(|e| EtlError::Insert {
                row: idx,
                inserted,
                message: e.to_string(),
            })?;
        inserted += 1;
    }

    let report = AggregateReport {
        target: target.clone(),
        columns: result.columns().to_vec(),
        result_rows: result.len(),
        inserted,
        skipped_empty,
        elapsed: start.elapsed(),
    };
    info!(
        table = %target,
        inserted = report.inserted,
        skipped = report.skipped_empty,
        elapsed = ?report.elapsed,
        "aggregation stored"
    );
    Ok(report)
}
