pub mod aggregate;
pub mod insert;
pub mod provision;

pub use aggregate::{
    bind_source_table, prepare_aggregate, store_aggregate, AggregateReport,
    DEFAULT_AGGREGATION_QUERY,
};
pub use insert::{bulk_insert, InsertReport, RowErrorPolicy, RowFailure};
pub use provision::ensure_table;
