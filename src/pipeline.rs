use std::fmt;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{with_timeout, EtlError, Result};
use crate::extract::{extract, ExtractReport};
use crate::load::{
    bulk_insert, ensure_table, prepare_aggregate, store_aggregate, AggregateReport, InsertReport,
};
use crate::record::read_csv;
use crate::store::{self, Dsn, Store, TableSchema};
use crate::warehouse::{BigQueryWarehouse, Warehouse};

/// Lifecycle of one pipeline run. Nothing survives between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Connecting,
    SchemaEnsured,
    Inserting,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Connecting => "Connecting",
            PipelineState::SchemaEnsured => "SchemaEnsured",
            PipelineState::Inserting => "Inserting",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// `Connecting -> Inserting` covers sinks without a schema (the flat file);
    /// `Inserting -> SchemaEnsured` covers a second target in the same run.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Idle, Connecting)
            | (Connecting, SchemaEnsured)
            | (Connecting, Inserting)
            | (SchemaEnsured, Inserting)
            | (Inserting, SchemaEnsured)
            | (Inserting, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of a single run and the path it took.
#[derive(Debug, Clone)]
pub struct Run {
    name: &'static str,
    state: PipelineState,
    trail: Vec<PipelineState>,
}

impl Run {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: PipelineState::Idle,
            trail: vec![PipelineState::Idle],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn trail(&self) -> &[PipelineState] {
        &self.trail
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(EtlError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(pipeline = self.name, from = %self.state, to = %next, "state");
        self.state = next;
        self.trail.push(next);
        Ok(())
    }

    /// Move to `Failed` and hand the error back for propagation.
    pub fn fail(&mut self, err: EtlError) -> EtlError {
        error!(pipeline = self.name, state = %self.state, class = err.class(), "{}", err);
        if self.state.can_advance_to(PipelineState::Failed) {
            self.state = PipelineState::Failed;
            self.trail.push(PipelineState::Failed);
        }
        err
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Some rows were rejected under the `skip` row-error policy.
    PartialSuccess,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub insert: InsertReport,
    pub aggregate: Option<AggregateReport>,
}

impl LoadReport {
    pub fn outcome(&self) -> Outcome {
        if self.insert.is_partial() {
            Outcome::PartialSuccess
        } else {
            Outcome::Success
        }
    }
}

/// Extractor: warehouse -> flat file.
pub async fn run_extract(cfg: &Config) -> Result<ExtractReport> {
    let mut run = Run::new("extract");
    let sql = cfg.extract.sql().map_err(|e| run.fail(e))?;

    run.advance(PipelineState::Connecting)?;
    let connect = BigQueryWarehouse::connect(
        cfg.extract.credentials.as_deref(),
        cfg.extract.project_id.clone(),
        cfg.extract.timeout(),
    );
    let mut warehouse = with_timeout("warehouse auth", cfg.extract.timeout(), connect)
        .await
        .map_err(|e| run.fail(e))?;

    extract_with(&mut run, &mut warehouse, &sql, cfg).await
}

/// The extract run against any warehouse, once connected.
pub async fn extract_with<W: Warehouse + ?Sized>(
    run: &mut Run,
    warehouse: &mut W,
    sql: &str,
    cfg: &Config,
) -> Result<ExtractReport> {
    run.advance(PipelineState::Inserting)?;
    let report = extract(
        warehouse,
        sql,
        cfg.extract.row_limit,
        &cfg.extract.out_file,
        cfg.extract.timeout(),
    )
    .await
    .map_err(|e| run.fail(e))?;
    run.advance(PipelineState::Done)?;
    Ok(report)
}

async fn open(dsn: &Dsn, cfg: &Config) -> Result<Box<dyn Store>> {
    with_timeout("database connect", cfg.load.timeout(), store::connect(dsn)).await
}

/// Close `store` and return `res`; the stage's own error wins over a close error.
async fn finish<T>(store: Box<dyn Store>, res: Result<T>) -> Result<T> {
    let closed = store.close().await;
    let value = res?;
    if let Err(e) = closed {
        warn!(error = %e, "closing connection failed");
    }
    Ok(value)
}

/// Loader/Transformer: flat file -> table, then optionally aggregation -> second table.
///
/// Provisioning, insertion and aggregation each use their own connection.
pub async fn run_load(cfg: &Config) -> Result<LoadReport> {
    let mut run = Run::new("load");
    cfg.validate_load().map_err(|e| run.fail(e))?;
    let dsn = cfg.load.dsn().map_err(|e| run.fail(e))?;
    let target = cfg.load.target().map_err(|e| run.fail(e))?;
    let timeout = cfg.load.timeout();

    let mut set = read_csv(&cfg.load.in_file, &cfg.load.null_markers()).map_err(|e| run.fail(e))?;
    set.rename_columns(&cfg.load.rename_columns);
    let schema = TableSchema::new(target.clone(), set.columns()).map_err(|e| run.fail(e))?;

    run.advance(PipelineState::Connecting)?;
    let mut store = open(&dsn, cfg).await.map_err(|e| run.fail(e))?;
    let res = ensure_table(store.as_mut(), &schema, timeout).await;
    finish(store, res).await.map_err(|e| run.fail(e))?;
    run.advance(PipelineState::SchemaEnsured)?;

    run.advance(PipelineState::Inserting)?;
    let mut store = open(&dsn, cfg).await.map_err(|e| run.fail(e))?;
    let res = bulk_insert(store.as_mut(), &set, &target, cfg.load.on_row_error, timeout).await;
    let insert = finish(store, res).await.map_err(|e| run.fail(e))?;

    let aggregate = if cfg.load.run_aggregate {
        Some(aggregate_stage(&mut run, &dsn, cfg).await?)
    } else {
        None
    };

    run.advance(PipelineState::Done)?;
    Ok(LoadReport { insert, aggregate })
}

/// Aggregator on its own: query the loaded table and store the result.
pub async fn run_aggregate(cfg: &Config) -> Result<AggregateReport> {
    let mut run = Run::new("aggregate");
    cfg.validate_aggregate().map_err(|e| run.fail(e))?;
    let dsn = cfg.load.dsn().map_err(|e| run.fail(e))?;

    run.advance(PipelineState::Connecting)?;
    let report = aggregate_stage(&mut run, &dsn, cfg).await?;
    run.advance(PipelineState::Done)?;
    Ok(report)
}

async fn aggregate_stage(run: &mut Run, dsn: &Dsn, cfg: &Config) -> Result<AggregateReport> {
    let target = cfg.aggregate_target().map_err(|e| run.fail(e))?;
    let source = cfg.aggregate_source_database().map_err(|e| run.fail(e))?;
    let query = cfg.aggregation_query().map_err(|e| run.fail(e))?;
    let timeout = cfg.load.timeout();

    let mut store = open(dsn, cfg).await.map_err(|e| run.fail(e))?;
    let result = match prepare_aggregate(store.as_mut(), &source, &query, &target, timeout).await {
        Ok(result) => result,
        Err(e) => return finish(store, Err(e)).await.map_err(|e| run.fail(e)),
    };
    run.advance(PipelineState::SchemaEnsured)?;

    run.advance(PipelineState::Inserting)?;
    let res = store_aggregate(store.as_mut(), &result, &target, timeout).await;
    finish(store, res).await.map_err(|e| run.fail(e))
}
