use async_trait::async_trait;
use mysql_async::{prelude::*, Conn, OptsBuilder, Params, Row, Value};
use tracing::{debug, trace};

use super::{Dialect, Dsn, Store};
use crate::error::{EtlError, Result};
use crate::record::RecordSet;

// Server error codes that get their own failure class.
const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
const ER_ACCESS_DENIED_ERROR: u16 = 1045;
const ER_BAD_DB_ERROR: u16 = 1049;
const ER_TABLE_EXISTS_ERROR: u16 = 1050;
const ER_BAD_FIELD_ERROR: u16 = 1054;
const ER_NO_SUCH_TABLE: u16 = 1146;

/// MySQL backend over a single `mysql_async` connection.
pub struct MySqlStore {
    conn: Conn,
}

impl MySqlStore {
    /// Connect without selecting a default database; statements use qualified names.
    pub async fn connect(dsn: &Dsn) -> Result<Self> {
        let Dsn::MySql {
            host,
            port,
            user,
            password,
            ..
        } = dsn
        else {
            return Err(EtlError::Config(format!("{} is not a mysql DSN", dsn)));
        };

        let opts = OptsBuilder::default()
            .ip_or_hostname(host.clone())
            .tcp_port(*port)
            .user(Some(user.clone()))
            .pass(password.clone());
        let conn = Conn::new(opts).await.map_err(|e| classify(e, None))?;
        debug!(dsn = %dsn, "connected to mysql");
        Ok(Self { conn })
    }
}

/// Map a driver error onto the failure taxonomy.
pub(crate) fn classify(err: mysql_async::Error, sql: Option<&str>) -> EtlError {
    match &err {
        mysql_async::Error::Server(server) => classify_server(server.code, &server.message, sql),
        _ => EtlError::query(err.to_string(), sql),
    }
}

fn classify_server(code: u16, message: &str, sql: Option<&str>) -> EtlError {
    let message = format!("[{}] {}", code, message);
    match code {
        ER_DBACCESS_DENIED_ERROR | ER_ACCESS_DENIED_ERROR => EtlError::Auth(message),
        ER_BAD_DB_ERROR | ER_TABLE_EXISTS_ERROR | ER_BAD_FIELD_ERROR | ER_NO_SUCH_TABLE => {
            EtlError::Schema(message)
        }
        _ => EtlError::query(message, sql),
    }
}

fn render(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        Value::Date(y, m, d, 0, 0, 0, 0) => Some(format!("{:04}-{:02}-{:02}", y, m, d)),
        Value::Date(y, m, d, h, i, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, m, d, h, i, s, us
        )),
        Value::Time(neg, days, h, i, s, us) => Some(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if neg { "-" } else { "" },
            days * 24 + h as u32,
            i,
            s,
            us
        )),
    }
}

#[async_trait]
impl Store for MySqlStore {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "mysql execute");
        self.conn
            .query_drop(sql)
            .await
            .map_err(|e| classify(e, Some(sql)))
    }

    async fn execute_params(&mut self, sql: &str, values: &[Option<&str>]) -> Result<()> {
        let params = Params::Positional(
            values
                .iter()
                .map(|v| match v {
                    Some(s) => Value::from(*s),
                    None => Value::NULL,
                })
                .collect(),
        );
        self.conn
            .exec_drop(sql, params)
            .await
            .map_err(|e| classify(e, Some(sql)))
    }

    async fn query(&mut self, sql: &str) -> Result<RecordSet> {
        trace!(sql, "mysql query");
        let mut result = self
            .conn
            .query_iter(sql)
            .await
            .map_err(|e| classify(e, Some(sql)))?;
        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let rows: Vec<Row> = result
            .collect()
            .await
            .map_err(|e| classify(e, Some(sql)))?;

        let mut set = RecordSet::new(columns);
        for row in rows {
            let cells = (0..row.len())
                .map(|i| row.get::<Value, usize>(i).and_then(render))
                .collect();
            set.push_row(cells)?;
        }
        Ok(set)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| classify(e, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_is_auth() {
        let err = classify_server(1045, "Access denied for user 'root'@'localhost'", None);
        assert_eq!(err.class(), "AuthError");
        let err = classify_server(1044, "Access denied for user to database 'x'", None);
        assert_eq!(err.class(), "AuthError");
    }

    #[test]
    fn missing_objects_are_schema_errors() {
        for code in [1049, 1050, 1054, 1146] {
            assert_eq!(classify_server(code, "nope", None).class(), "SchemaError");
        }
    }

    #[test]
    fn other_server_errors_keep_sql() {
        match classify_server(1064, "syntax", Some("SELEC 1")) {
            EtlError::Query { sql, message } => {
                assert_eq!(sql.as_deref(), Some("SELEC 1"));
                assert!(message.contains("1064"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn renders_driver_values() {
        assert_eq!(render(Value::NULL), None);
        assert_eq!(render(Value::Bytes(b"Paris".to_vec())).as_deref(), Some("Paris"));
        assert_eq!(render(Value::Double(15.0)).as_deref(), Some("15"));
        assert_eq!(
            render(Value::Date(2024, 1, 2, 0, 0, 0, 0)).as_deref(),
            Some("2024-01-02")
        );
    }

    #[tokio::test]
    #[ignore] // needs a live server: NETPERF_TEST_MYSQL=mysql://root:pw@localhost
    async fn live_round_trip() {
        let raw = std::env::var("NETPERF_TEST_MYSQL").expect("NETPERF_TEST_MYSQL");
        let dsn = Dsn::parse(&raw).unwrap();
        let mut store = MySqlStore::connect(&dsn).await.unwrap();
        let set = store.query("SELECT 1 AS one").await.unwrap();
        assert_eq!(set.rows()[0][0].as_deref(), Some("1"));
        Box::new(store).close().await.unwrap();
    }
}
