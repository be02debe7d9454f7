use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::error::{with_timeout, Result};
use crate::record::write_csv;
use crate::warehouse::Warehouse;

const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractReport {
    pub out_file: PathBuf,
    pub rows: usize,
    pub columns: usize,
    pub elapsed: Duration,
}

/// Run `sql` against the warehouse and write the result to `out_file` as CSV,
/// replacing whatever was there.
#[tracing::instrument(level = "info", skip(warehouse, sql), fields(out = %out_file.display()))]
pub async fn extract<W: Warehouse + ?Sized>(
    warehouse: &mut W,
    sql: &str,
    row_limit: u64,
    out_file: &Path,
    timeout: Duration,
) -> Result<ExtractReport> {
    let start = Instant::now();
    debug!(sql, row_limit, "running warehouse query");

    let set = with_timeout("warehouse query", timeout, warehouse.fetch(sql, row_limit)).await?;
    info!(rows = set.len(), columns = set.num_columns(), "materialized result");
    for line in set.head(PREVIEW_ROWS) {
        debug!("preview: {}", line);
    }

    write_csv(out_file, &set)?;
    let report = ExtractReport {
        out_file: out_file.to_path_buf(),
        rows: set.len(),
        columns: set.num_columns(),
        elapsed: start.elapsed(),
    };
    info!(rows = report.rows, elapsed = ?report.elapsed, "extract done");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtlError;
    use crate::record::RecordSet;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::tempdir;

    /// Serves a fixed record set, honouring the row limit.
    struct FixedWarehouse {
        set: RecordSet,
        calls: usize,
    }

    #[async_trait]
    impl Warehouse for FixedWarehouse {
        async fn fetch(&mut self, _sql: &str, row_limit: u64) -> crate::error::Result<RecordSet> {
            self.calls += 1;
            let rows = self
                .set
                .rows()
                .iter()
                .take(row_limit as usize)
                .cloned()
                .collect();
            RecordSet::from_rows(self.set.columns().to_vec(), rows)
        }
    }

    struct DeniedWarehouse;

    #[async_trait]
    impl Warehouse for DeniedWarehouse {
        async fn fetch(&mut self, _sql: &str, _row_limit: u64) -> crate::error::Result<RecordSet> {
            Err(EtlError::Auth("403 Forbidden".into()))
        }
    }

    fn sample() -> RecordSet {
        let s = |v: &str| Some(v.to_string());
        RecordSet::from_rows(
            vec!["date".into(), "city".into(), "MeanThroughputMbps".into()],
            vec![
                vec![s("2024-01-01"), s("Paris"), s("10")],
                vec![s("2024-01-01"), None, s("20")],
                vec![s("2024-01-02"), s("Lyon"), s("30")],
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn writes_result_and_reports_counts() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("mlab_ndt_data.csv");
        let mut wh = FixedWarehouse {
            set: sample(),
            calls: 0,
        };

        let report = extract(&mut wh, "SELECT 1", 2, &out, Duration::from_secs(5)).await?;
        assert_eq!(report.rows, 2);
        assert_eq!(report.columns, 3);
        assert_eq!(wh.calls, 1);
        assert_eq!(
            fs::read_to_string(&out)?,
            "date,city,MeanThroughputMbps\n2024-01-01,Paris,10\n2024-01-01,,20\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_window_writes_header_only() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("empty.csv");
        let mut wh = FixedWarehouse {
            set: RecordSet::new(vec!["date".into(), "city".into()]),
            calls: 0,
        };

        let report = extract(&mut wh, "SELECT 1", 1000, &out, Duration::from_secs(5)).await?;
        assert_eq!(report.rows, 0);
        assert_eq!(fs::read_to_string(&out)?, "date,city\n");
        Ok(())
    }

    #[tokio::test]
    async fn auth_failure_leaves_existing_file_alone() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("keep.csv");
        fs::write(&out, "old\n")?;

        let err = extract(&mut DeniedWarehouse, "SELECT 1", 10, &out, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.class(), "AuthError");
        assert_eq!(fs::read_to_string(&out)?, "old\n");
        Ok(())
    }
}
