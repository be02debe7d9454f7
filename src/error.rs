use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Failure classes a pipeline stage can report.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Bad credentials or missing privilege.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Database/table missing or malformed, or an identifier that fails the allow-list.
    #[error("schema error: {0}")]
    Schema(String),

    /// Malformed or failing SQL.
    #[error("query error: {message}")]
    Query { message: String, sql: Option<String> },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error in {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A row-level insert failure that stopped the batch.
    #[error("insert failed at row {row} after {inserted} rows: {message}")]
    Insert {
        row: usize,
        inserted: u64,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pipeline transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl EtlError {
    pub fn query(message: impl Into<String>, sql: Option<&str>) -> Self {
        EtlError::Query {
            message: message.into(),
            sql: sql.map(str::to_string),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EtlError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short class name, as printed in the final run summary.
    pub fn class(&self) -> &'static str {
        match self {
            EtlError::Auth(_) => "AuthError",
            EtlError::Schema(_) => "SchemaError",
            EtlError::Query { .. } | EtlError::Insert { .. } => "QueryError",
            EtlError::Io { .. } | EtlError::Csv { .. } => "IOError",
            EtlError::Timeout { .. } => "TimeoutError",
            EtlError::Config(_) => "ConfigError",
            EtlError::InvalidTransition { .. } => "StateError",
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`EtlError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(EtlError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_maps_to_typed_error() {
        let res: Result<()> = with_timeout("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match res {
            Err(EtlError::Timeout { operation, .. }) => assert_eq!(operation, "slow op"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fast_future_passes_through() {
        let res = with_timeout("fast op", Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(EtlError::Auth("x".into()).class(), "AuthError");
        assert_eq!(EtlError::Schema("x".into()).class(), "SchemaError");
        assert_eq!(EtlError::query("x", None).class(), "QueryError");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(EtlError::io("a.csv", io).class(), "IOError");
    }
}
