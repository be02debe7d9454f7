use async_trait::async_trait;
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::job::get_query_results::GetQueryResultsRequest;
use google_cloud_bigquery::http::job::query::QueryRequest;
use google_cloud_bigquery::http::table::TableFieldSchema;
use google_cloud_bigquery::http::tabledata::list::{Tuple, Value as BqValue};
use serde_json::{Map, Value as Json};
use std::{path::Path, time::Duration};
use tracing::{debug, info};

use super::Warehouse;
use crate::error::{EtlError, Result};
use crate::record::RecordSet;

const PAGE_SIZE: i64 = 10_000;

/// BigQuery client authenticated with a service-account key file.
pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    poll_timeout: Duration,
}

impl BigQueryWarehouse {
    /// Authenticate with `credentials` (falls back to application default credentials when `None`).
    /// `project_id` overrides the project found in the key file.
    pub async fn connect(
        credentials: Option<&Path>,
        project_id: Option<String>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        if let Some(path) = credentials {
            if !path.is_file() {
                return Err(EtlError::Auth(format!(
                    "service account key {} does not exist",
                    path.display()
                )));
            }
            std::env::set_var("GOOGLE_APPLICATION_CREDENTIALS", path);
        }

        let (config, key_project) = ClientConfig::new_with_auth()
            .await
            .map_err(|e| EtlError::Auth(format!("authenticating BigQuery client: {}", e)))?;
        let project_id = project_id.or(key_project).ok_or_else(|| {
            EtlError::Auth("no project id in credentials and none configured".into())
        })?;
        let client = Client::new(config)
            .await
            .map_err(|e| EtlError::Auth(format!("creating BigQuery client: {}", e)))?;

        info!(project = %project_id, "authenticated to BigQuery");
        Ok(Self {
            client,
            project_id,
            poll_timeout,
        })
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn fetch(&mut self, sql: &str, row_limit: u64) -> Result<RecordSet> {
        let timeout_ms = Some(self.poll_timeout.as_millis() as i64);
        let request = QueryRequest {
            query: sql.to_string(),
            use_legacy_sql: false,
            max_results: Some(PAGE_SIZE),
            timeout_ms,
            ..Default::default()
        };
        let first = self
            .client
            .job()
            .query(&self.project_id, &request)
            .await
            .map_err(|e| classify(&e.to_string(), sql))?;

        let job = first.job_reference;
        let mut schema = first.schema;
        let mut tuples = first.rows.unwrap_or_default();
        let mut page_token = first.page_token;
        let mut complete = first.job_complete;
        let mut raw_rows: Vec<Vec<Cell>> = Vec::new();

        loop {
            let room = (row_limit as usize).saturating_sub(raw_rows.len());
            raw_rows.extend(tuples.drain(..).take(room).map(Cell::from_tuple));
            if raw_rows.len() as u64 >= row_limit || (complete && page_token.is_none()) {
                break;
            }

            debug!(job = %job.job_id, fetched = raw_rows.len(), complete, "fetching next page");
            let req = GetQueryResultsRequest {
                page_token: page_token.clone(),
                max_results: Some(PAGE_SIZE),
                timeout_ms,
                location: job.location.clone(),
                ..Default::default()
            };
            let page = self
                .client
                .job()
                .get_query_results(&job.project_id, &job.job_id, &req)
                .await
                .map_err(|e| classify(&e.to_string(), sql))?;
            if schema.is_none() {
                schema = page.schema;
            }
            tuples = page.rows.unwrap_or_default();
            page_token = page.page_token;
            complete = page.job_complete;
        }

        let fields: Vec<Field> = schema
            .map(|s| s.fields.iter().map(Field::from_schema).collect())
            .ok_or_else(|| EtlError::query("query finished without a result schema", Some(sql)))?;
        materialize(&fields, raw_rows)
    }
}

/// Permission and credential failures come back as HTTP 401/403.
fn classify(message: &str, sql: &str) -> EtlError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthenticated")
        || lower.contains("permission")
        || lower.contains("access denied")
    {
        EtlError::Auth(message.to_string())
    } else {
        EtlError::query(message, Some(sql))
    }
}

/// Column shape, including nested RECORD fields.
#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    fields: Vec<Field>,
}

impl Field {
    fn from_schema(f: &TableFieldSchema) -> Self {
        Self {
            name: f.name.clone(),
            fields: f
                .fields
                .as_ref()
                .map(|fs| fs.iter().map(Field::from_schema).collect())
                .unwrap_or_default(),
        }
    }
}

/// A decoded cell. BigQuery sends every scalar as a string.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Text(String),
    List(Vec<Cell>),
    Record(Vec<Cell>),
}

impl Cell {
    fn from_tuple(t: Tuple) -> Vec<Cell> {
        t.f.into_iter().map(|c| Cell::from_value(c.v)).collect()
    }

    fn from_value(v: BqValue) -> Self {
        match v {
            BqValue::Null => Cell::Null,
            BqValue::String(s) => Cell::Text(s),
            BqValue::Array(cells) => {
                Cell::List(cells.into_iter().map(|c| Cell::from_value(c.v)).collect())
            }
            BqValue::Struct(t) => Cell::Record(Cell::from_tuple(t)),
        }
    }

    fn to_json(&self, field: &Field) -> Json {
        match self {
            Cell::Null => Json::Null,
            Cell::Text(s) => Json::String(s.clone()),
            Cell::List(items) => Json::Array(items.iter().map(|c| c.to_json(field)).collect()),
            Cell::Record(values) => {
                let mut obj = Map::new();
                for (i, v) in values.iter().enumerate() {
                    let child = field.fields.get(i).cloned().unwrap_or_else(|| Field {
                        name: format!("f{}", i),
                        fields: Vec::new(),
                    });
                    obj.insert(child.name.clone(), v.to_json(&child));
                }
                Json::Object(obj)
            }
        }
    }

    /// Scalars stay as they are; nested values become JSON text.
    fn render(&self, field: &Field) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s.clone()),
            nested => Some(nested.to_json(field).to_string()),
        }
    }
}

fn materialize(fields: &[Field], rows: Vec<Vec<Cell>>) -> Result<RecordSet> {
    let mut set = RecordSet::new(fields.iter().map(|f| f.name.clone()).collect());
    for row in rows {
        let cells = fields
            .iter()
            .zip(row.iter().chain(std::iter::repeat(&Cell::Null)))
            .map(|(f, c)| c.render(f))
            .collect();
        set.push_row(cells)?;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> Field {
        Field {
            name: name.into(),
            fields: vec![],
        }
    }

    #[test]
    fn permission_errors_are_auth() {
        assert_eq!(
            classify("HTTP 403 Forbidden: Access Denied: Project x", "SELECT 1").class(),
            "AuthError"
        );
        assert_eq!(
            classify("Syntax error: Unexpected keyword", "SELEC 1").class(),
            "QueryError"
        );
    }

    #[test]
    fn nested_records_render_as_json() {
        let fields = vec![
            leaf("date"),
            Field {
                name: "client".into(),
                fields: vec![Field {
                    name: "Geo".into(),
                    fields: vec![leaf("City"), leaf("CountryName")],
                }],
            },
            leaf("MinRTT"),
        ];
        let row = vec![
            Cell::Text("2024-01-01".into()),
            Cell::Record(vec![Cell::Record(vec![
                Cell::Text("Paris".into()),
                Cell::Null,
            ])]),
            Cell::Null,
        ];

        let set = materialize(&fields, vec![row]).unwrap();
        assert_eq!(set.columns(), &["date", "client", "MinRTT"]);
        assert_eq!(set.rows()[0][0].as_deref(), Some("2024-01-01"));
        assert_eq!(
            set.rows()[0][1].as_deref(),
            Some(r#"{"Geo":{"City":"Paris","CountryName":null}}"#)
        );
        assert_eq!(set.rows()[0][2], None);
    }

    #[test]
    fn repeated_fields_render_as_arrays() {
        let fields = vec![leaf("tags")];
        let row = vec![Cell::List(vec![Cell::Text("a".into()), Cell::Text("b".into())])];
        let set = materialize(&fields, vec![row]).unwrap();
        assert_eq!(set.rows()[0][0].as_deref(), Some(r#"["a","b"]"#));
    }

    #[test]
    fn short_rows_are_padded_with_null() {
        let set = materialize(&[leaf("a"), leaf("b")], vec![vec![Cell::Text("1".into())]]).unwrap();
        assert_eq!(set.rows()[0], vec![Some("1".to_string()), None]);
    }
}
