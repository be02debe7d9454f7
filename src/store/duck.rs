// src/store/duck.rs

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use duckdb::{
    params_from_iter,
    types::{TimeUnit, Value},
    Connection,
};
use std::path::Path;
use tracing::{debug, trace};

use super::{Dialect, Store};
use crate::error::{EtlError, Result};
use crate::record::RecordSet;

/// Embedded DuckDB backend. Databases are modelled as DuckDB schemas.
pub struct DuckStore {
    conn: Connection,
}

impl DuckStore {
    /// Open a DuckDB database on disk at `path` (created if missing), or in memory for `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p),
            None => Connection::open_in_memory(),
        }
        .map_err(|e| {
            EtlError::Schema(format!(
                "opening duckdb {}: {}",
                path.map(|p| p.display().to_string())
                    .unwrap_or_else(|| ":memory:".into()),
                e
            ))
        })?;
        debug!(path = ?path, "opened duckdb");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(None)
    }
}

/// Catalog errors mean a missing or clashing database/table/column.
fn classify(err: duckdb::Error, sql: &str) -> EtlError {
    let message = err.to_string();
    if message.contains("Catalog Error") || message.contains("Binder Error") {
        EtlError::Schema(message)
    } else {
        EtlError::query(message, Some(sql))
    }
}

fn micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v * 1_000_000,
        TimeUnit::Millisecond => v * 1_000,
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Text form of a result value. Types with no faithful text form are an error.
fn render(value: Value, sql: &str) -> Result<Option<String>> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::Text(s) => s,
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
        Value::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64)))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .ok_or_else(|| EtlError::query(format!("date out of range: {} days", days), Some(sql)))?,
        Value::Timestamp(unit, v) => DateTime::from_timestamp_micros(micros(unit, v))
            .map(|ts| ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string())
            .ok_or_else(|| EtlError::query(format!("timestamp out of range: {}", v), Some(sql)))?,
        Value::Time64(unit, v) => {
            let us = micros(unit, v);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (us / 1_000_000) as u32,
                ((us % 1_000_000) * 1_000) as u32,
            )
            .map(|t| t.format("%H:%M:%S%.f").to_string())
            .ok_or_else(|| EtlError::query(format!("time out of range: {}", v), Some(sql)))?
        }
        other => {
            return Err(EtlError::query(
                format!("no text form for result value {:?}", other),
                Some(sql),
            ))
        }
    };
    Ok(Some(text))
}

#[async_trait]
impl Store for DuckStore {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "duckdb execute");
        self.conn.execute_batch(sql).map_err(|e| classify(e, sql))
    }

    async fn execute_params(&mut self, sql: &str, values: &[Option<&str>]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(|e| classify(e, sql))?;
        stmt.execute(params_from_iter(values.iter()))
            .map_err(|e| classify(e, sql))?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<RecordSet> {
        trace!(sql, "duckdb query");
        let mut stmt = self.conn.prepare(sql).map_err(|e| classify(e, sql))?;
        let mut rows = stmt.query([]).map_err(|e| classify(e, sql))?;
        let columns: Vec<String> = rows
            .as_ref()
            .map(|s| s.column_names())
            .unwrap_or_default();

        let width = columns.len();
        let mut set = RecordSet::new(columns);
        while let Some(row) = rows.next().map_err(|e| classify(e, sql))? {
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                let v: Value = row.get(i).map_err(|e| classify(e, sql))?;
                cells.push(render(v, sql)?);
            }
            set.push_row(cells)?;
        }
        Ok(set)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| EtlError::query(format!("closing duckdb: {}", e), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn query_renders_values_as_text() -> Result<()> {
        let mut store = DuckStore::open_in_memory()?;
        let set = store
            .query("SELECT 1 AS one, 2.5::DOUBLE AS half, NULL AS nothing, 'x' AS txt, DATE '2024-01-31' AS day")
            .await?;
        assert_eq!(set.columns(), &["one", "half", "nothing", "txt", "day"]);
        assert_eq!(
            set.rows()[0],
            vec![
                Some("1".to_string()),
                Some("2.5".to_string()),
                None,
                Some("x".to_string()),
                Some("2024-01-31".to_string()),
            ]
        );
        Box::new(store).close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn timestamps_and_times_render_like_sql_literals() -> Result<()> {
        let mut store = DuckStore::open_in_memory()?;
        let set = store
            .query(
                "SELECT TIMESTAMP '2024-01-01 12:30:00' AS ts, \
                 TIMESTAMP '2024-01-01 12:30:00.25' AS frac, TIME '08:15:00' AS t",
            )
            .await?;
        assert_eq!(
            set.rows()[0],
            vec![
                Some("2024-01-01 12:30:00".to_string()),
                Some("2024-01-01 12:30:00.250".to_string()),
                Some("08:15:00".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn values_without_text_form_are_query_errors() -> Result<()> {
        let mut store = DuckStore::open_in_memory()?;
        let err = store.query("SELECT INTERVAL 1 DAY AS i").await.unwrap_err();
        assert_eq!(err.class(), "QueryError");
        Ok(())
    }

    #[tokio::test]
    async fn params_bind_null() -> Result<()> {
        let mut store = DuckStore::open_in_memory()?;
        store.execute("CREATE TABLE t (a VARCHAR, b VARCHAR)").await?;
        store
            .execute_params("INSERT INTO t (a, b) VALUES (?, ?)", &[Some("1"), None])
            .await?;
        let set = store.query("SELECT a, b IS NULL AS b_null FROM t").await?;
        assert_eq!(
            set.rows()[0],
            vec![Some("1".to_string()), Some("true".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_table_is_schema_error() -> Result<()> {
        let mut store = DuckStore::open_in_memory()?;
        let err = store.query("SELECT * FROM nowhere").await.unwrap_err();
        assert_eq!(err.class(), "SchemaError");
        let err = store.execute("SELEC 1").await.unwrap_err();
        assert_eq!(err.class(), "QueryError");
        Ok(())
    }
}
