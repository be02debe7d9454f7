use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{EtlError, Result};
use crate::load::{bind_source_table, RowErrorPolicy, DEFAULT_AGGREGATION_QUERY};
use crate::record::{NullMarkers, DEFAULT_NULL_MARKERS};
use crate::store::{ddl::validate_ident, Dsn, TableRef};
use crate::warehouse::WarehouseQuery;

/// Environment variable consulted for the database password when the DSN has none.
pub const DB_PASSWORD_ENV: &str = "NETPERF_DB_PASSWORD";

/// Database used when neither the config nor the DSN names one.
pub const DEFAULT_DATABASE: &str = "mlab_data";

/// Top-level config file layout. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub extract: ExtractConfig,
    pub load: LoadConfig,
    pub aggregate: AggregateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// Service-account key file; application default credentials when unset.
    pub credentials: Option<PathBuf>,
    pub project_id: Option<String>,
    pub table: String,
    pub date_column: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub row_limit: u64,
    /// Verbatim SQL that replaces the table/date-range query.
    pub source_query: Option<String>,
    pub out_file: PathBuf,
    pub timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            project_id: None,
            table: "measurement-lab.ndt.unified_downloads".into(),
            date_column: "date".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap_or_default(),
            row_limit: 1000,
            source_query: None,
            out_file: PathBuf::from("mlab_ndt_data.csv"),
            timeout_secs: 300,
        }
    }
}

impl ExtractConfig {
    pub fn query(&self) -> WarehouseQuery {
        WarehouseQuery {
            table: self.table.clone(),
            date_column: self.date_column.clone(),
            start: self.start_date,
            end: self.end_date,
            row_limit: self.row_limit,
        }
    }

    /// The SQL to send: the override if set, otherwise the bounded table query.
    pub fn sql(&self) -> Result<String> {
        match self.source_query.as_deref().map(str::trim) {
            Some("") => Err(EtlError::Config("source query is empty".into())),
            Some(q) => {
                if self.row_limit == 0 {
                    return Err(EtlError::Config("row limit must be positive".into()));
                }
                Ok(q.to_string())
            }
            None => self.query().to_sql(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    pub in_file: PathBuf,
    pub dsn: String,
    /// Taken from the DSN path when unset; the two must agree when both are given.
    pub database: Option<String>,
    pub table: String,
    pub null_markers: Vec<String>,
    /// Source header -> target column name, applied before provisioning.
    pub rename_columns: BTreeMap<String, String>,
    pub on_row_error: RowErrorPolicy,
    /// Also run the aggregation stage after loading.
    pub run_aggregate: bool,
    pub timeout_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            in_file: PathBuf::from("mlab_uploads_d1_data.csv"),
            dsn: "mysql://root@localhost:3306".into(),
            database: None,
            table: "upload_data_d1".into(),
            null_markers: DEFAULT_NULL_MARKERS.iter().map(|m| m.to_string()).collect(),
            rename_columns: BTreeMap::new(),
            on_row_error: RowErrorPolicy::Abort,
            run_aggregate: true,
            timeout_secs: 60,
        }
    }
}

impl LoadConfig {
    pub fn dsn(&self) -> Result<Dsn> {
        Ok(Dsn::parse(&self.dsn)?.with_password(std::env::var(DB_PASSWORD_ENV).ok()))
    }

    /// The database rows are loaded into.
    pub fn database(&self) -> Result<String> {
        let dsn = Dsn::parse(&self.dsn)?;
        match (self.database.as_deref(), dsn.database()) {
            (Some(ours), Some(theirs)) if ours != theirs => Err(EtlError::Config(format!(
                "database `{}` disagrees with `{}` named in the DSN",
                ours, theirs
            ))),
            (Some(db), _) | (None, Some(db)) => Ok(db.to_string()),
            (None, None) => Ok(DEFAULT_DATABASE.to_string()),
        }
    }

    pub fn target(&self) -> Result<TableRef> {
        TableRef::new(&self.database()?, &self.table)
    }

    pub fn null_markers(&self) -> NullMarkers {
        NullMarkers::new(self.null_markers.iter().cloned())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateConfig {
    /// Database the query's unqualified table names resolve in; the load database when unset.
    pub source_database: Option<String>,
    /// Database of the result table; the load database when unset.
    pub database: Option<String>,
    pub table: String,
    /// `{table}` is replaced by the load table's name.
    pub query: String,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            source_database: None,
            database: None,
            table: "upload_data_avg".into(),
            query: DEFAULT_AGGREGATION_QUERY.into(),
        }
    }
}

impl Config {
    /// Read a YAML config file, or fall back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|e| EtlError::io(path, e))?;
        Self::from_yaml(&text)
            .map_err(|e| EtlError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EtlError::Config(e.to_string()))
    }

    /// Resolve the database aggregation reads from.
    pub fn aggregate_source_database(&self) -> Result<String> {
        match &self.aggregate.source_database {
            Some(db) => Ok(db.clone()),
            None => self.load.database(),
        }
    }

    pub fn aggregate_target(&self) -> Result<TableRef> {
        let database = match &self.aggregate.database {
            Some(db) => db.clone(),
            None => self.load.database()?,
        };
        TableRef::new(&database, &self.aggregate.table)
    }

    /// The aggregation query with the load table bound in.
    pub fn aggregation_query(&self) -> Result<String> {
        bind_source_table(&self.aggregate.query, &self.load.table)
    }

    /// Check everything the load pipeline needs.
    pub fn validate_load(&self) -> Result<()> {
        let dsn = self.load.dsn()?;
        if matches!(dsn, Dsn::DuckDb { path: None }) {
            return Err(EtlError::Config(
                "an in-memory DuckDB does not outlive a stage's connection; use a file DSN".into(),
            ));
        }
        self.load.target()?;
        for (from, to) in &self.load.rename_columns {
            validate_ident("column", to)
                .map_err(|e| EtlError::Config(format!("rename of `{}`: {}", from, e)))?;
        }
        if self.load.run_aggregate {
            self.validate_aggregate()?;
        }
        Ok(())
    }

    pub fn validate_aggregate(&self) -> Result<()> {
        self.aggregate_target()?;
        validate_ident("database", &self.aggregate_source_database()?)?;
        if self.aggregate.query.trim().is_empty() {
            return Err(EtlError::Config("aggregation query is empty".into()));
        }
        self.aggregation_query()?;
        Ok(())
    }
}
