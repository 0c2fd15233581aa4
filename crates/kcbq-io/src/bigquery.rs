//! [`TableBackend`] over the BigQuery v2 REST API.
//!
//! Authentication is a pre-issued bearer token; token refresh is left to
//! whoever writes the configuration. Page tokens are row offsets passed as
//! `startIndex`, which keeps them stable while rows are appended.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use kcbq_core::cursor::{from_epoch_seconds, parse_incrementing};
use kcbq_core::{
    BackendError, BigQuerySpec, DatasetRef, FieldSchema, IncrementalQuery, PageRequest,
    PageToken, Row, RowPage, TableBackend, TableDescription, TableRef,
};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Map, Number, Value};
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Server-side wait for `jobs.query` before it answers with an incomplete job.
const QUERY_TIMEOUT_MS: u64 = 10_000;

pub struct BigQueryBackend {
    http: Client,
    api_base: String,
    access_token: Option<String>,
    /// Schemas needed to decode `f`/`v` rows, filled on first use.
    descriptions: Mutex<HashMap<TableRef, TableDescription>>,
}

impl BigQueryBackend {
    pub fn new(spec: &BigQuerySpec) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(spec.request_timeout_ms))
            .build()
            .context("build BigQuery http client")?;
        let api_base = spec
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        if spec.access_token.is_none() {
            warn!(api_base = %api_base, "no access token configured, requests are unauthenticated");
        }
        Ok(Self {
            http,
            api_base,
            access_token: spec.access_token.clone(),
            descriptions: Mutex::new(HashMap::new()),
        })
    }

    fn dataset_url(&self, dataset: &DatasetRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            self.api_base, dataset.project_id, dataset.dataset_id
        )
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!("{}/tables/{}", self.dataset_url(&table.dataset()), table.table_id)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn call(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            BackendError::new(Some(status.as_u16()), format!("invalid response body: {e}"))
        })
    }

    async fn exists(&self, url: &str) -> Result<bool, BackendError> {
        match self.call(self.request(Method::GET, url)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remember(&self, table: &TableRef, description: &TableDescription) {
        self.descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.clone(), description.clone());
    }

    async fn fields(&self, table: &TableRef) -> Result<Vec<FieldSchema>, BackendError> {
        let cached = self
            .descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map(|d| d.schema.fields.clone());
        match cached {
            Some(fields) => Ok(fields),
            None => Ok(self.get_table(table).await?.schema.fields),
        }
    }
}

#[async_trait]
impl TableBackend for BigQueryBackend {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, BackendError> {
        self.exists(&self.dataset_url(dataset)).await
    }

    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), BackendError> {
        let url = format!("{}/projects/{}/datasets", self.api_base, dataset.project_id);
        let body = json!({
            "datasetReference": {
                "projectId": dataset.project_id,
                "datasetId": dataset.dataset_id,
            }
        });
        self.call(self.request(Method::POST, &url).json(&body)).await?;
        debug!(dataset = %dataset, "dataset created");
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, BackendError> {
        self.exists(&self.table_url(table)).await
    }

    async fn create_table(
        &self,
        table: &TableRef,
        description: &TableDescription,
    ) -> Result<TableDescription, BackendError> {
        let url = format!("{}/tables", self.dataset_url(&table.dataset()));
        let body = table_insert_body(table, description)?;
        let created = self.call(self.request(Method::POST, &url).json(&body)).await?;

        let created: TableDescription =
            serde_json::from_value(created).unwrap_or_else(|_| description.clone());
        self.remember(table, &created);
        Ok(created)
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableDescription, BackendError> {
        let resource = self.call(self.request(Method::GET, &self.table_url(table))).await?;
        let description: TableDescription = serde_json::from_value(resource)
            .map_err(|e| BackendError::new(None, format!("invalid table resource: {e}")))?;
        self.remember(table, &description);
        Ok(description)
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<(), BackendError> {
        let url = format!("{}/insertAll", self.table_url(table));
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "skipInvalidRows": false,
            "ignoreUnknownValues": false,
            "rows": rows,
        });
        let response = self.call(self.request(Method::POST, &url).json(&body)).await?;
        match response.get("insertErrors") {
            Some(Value::Array(errors)) if !errors.is_empty() => Err(
                BackendError::insert_rejected(Value::Array(errors.clone()).to_string()),
            ),
            _ => Ok(()),
        }
    }

    async fn list_rows(
        &self,
        table: &TableRef,
        page: &PageRequest,
    ) -> Result<RowPage, BackendError> {
        let start = match &page.token {
            Some(token) => token.as_str().parse::<u64>().map_err(|_| {
                BackendError::new(Some(400), format!("invalid page token `{token}`"))
                    .with_reason("invalid")
            })?,
            None => 0,
        };
        let fields = self.fields(table).await?;

        let url = format!("{}/data", self.table_url(table));
        let request = self.request(Method::GET, &url).query(&[
            ("startIndex", start.to_string()),
            ("maxResults", page.max_results.to_string()),
        ]);
        let response = self.call(request).await?;

        let rows = decode_rows(&fields, response.get("rows"));
        let total_rows = response.get("totalRows").and_then(parse_u64);
        let next = start + rows.len() as u64;
        Ok(RowPage {
            rows,
            next_token: Some(PageToken::new(next.to_string())),
            total_rows,
        })
    }

    async fn query_incremental(
        &self,
        table: &TableRef,
        query: &IncrementalQuery,
    ) -> Result<Vec<Map<String, Value>>, BackendError> {
        let url = format!("{}/projects/{}/queries", self.api_base, table.project_id);
        let body = incremental_query_body(table, query)?;
        let response = self.call(self.request(Method::POST, &url).json(&body)).await?;

        if !response.get("jobComplete").and_then(Value::as_bool).unwrap_or(false) {
            warn!(table = %table, "incremental query did not complete in time, retrying next poll");
            return Ok(Vec::new());
        }

        let fields: Vec<FieldSchema> = match response.pointer("/schema/fields") {
            Some(fields) => serde_json::from_value(fields.clone())
                .map_err(|e| BackendError::new(None, format!("invalid query schema: {e}")))?,
            None => Vec::new(),
        };
        Ok(decode_rows(&fields, response.get("rows")))
    }
}

/// Builds a [`BackendError`] from a non-2xx answer, picking the first
/// `error.errors[].reason` when the body is the usual JSON envelope.
pub fn error_from_body(status: u16, body: String) -> BackendError {
    let reason = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
        v.pointer("/error/errors/0/reason")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let error = BackendError::new(Some(status), body);
    match reason {
        Some(reason) => error.with_reason(reason),
        None => error,
    }
}

fn table_insert_body(
    table: &TableRef,
    description: &TableDescription,
) -> Result<Value, BackendError> {
    let mut body = serde_json::to_value(description)
        .map_err(|e| BackendError::new(None, format!("serialize table description: {e}")))?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "tableReference".to_string(),
            json!({
                "projectId": table.project_id,
                "datasetId": table.dataset_id,
                "tableId": table.table_id,
            }),
        );
    }
    Ok(body)
}

/// Column names are spliced into SQL, so only plain identifiers pass.
fn quote_column(name: &str) -> Result<String, BackendError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(
            BackendError::new(Some(400), format!("invalid column name `{name}`"))
                .with_reason("invalidQuery"),
        );
    }
    Ok(format!("`{name}`"))
}

fn query_parameter(name: &str, kind: &str, value: String) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": kind },
        "parameterValue": { "value": value },
    })
}

/// `jobs.query` request for the watermark predicate.
pub fn incremental_query_body(
    table: &TableRef,
    query: &IncrementalQuery,
) -> Result<Value, BackendError> {
    let inc = quote_column(&query.incrementing_column)?;
    let ts = quote_column(&query.timestamp_column)?;
    let sql = format!(
        "SELECT * FROM {} WHERE {ts} > @last_timestamp \
         OR ({ts} = @last_timestamp AND {inc} > @last_incrementing_value) \
         ORDER BY {ts} ASC, {inc} ASC LIMIT {}",
        table.sql_path(),
        query.limit
    );
    Ok(json!({
        "query": sql,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "queryParameters": [
            query_parameter(
                "last_incrementing_value",
                "INT64",
                query.watermark.last_incrementing_value.to_string(),
            ),
            query_parameter(
                "last_timestamp",
                "TIMESTAMP",
                query
                    .watermark
                    .last_timestamp
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ],
        "maxResults": query.limit,
        "timeoutMs": QUERY_TIMEOUT_MS,
    }))
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_u64(),
    }
}

/// Decodes REST rows (`{"f": [{"v": ...}, ...]}`) into column maps.
pub fn decode_rows(fields: &[FieldSchema], rows: Option<&Value>) -> Vec<Map<String, Value>> {
    match rows {
        Some(Value::Array(rows)) => rows.iter().map(|row| decode_struct(fields, row)).collect(),
        _ => Vec::new(),
    }
}

fn decode_struct(fields: &[FieldSchema], row: &Value) -> Map<String, Value> {
    let cells = row.get("f").and_then(Value::as_array);
    fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let cell = cells
                .and_then(|cells| cells.get(i))
                .and_then(|cell| cell.get("v"))
                .unwrap_or(&Value::Null);
            (field.name.clone(), decode_cell(field, cell))
        })
        .collect()
}

fn decode_cell(field: &FieldSchema, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if field.is_repeated() {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        return Value::Array(
            items
                .iter()
                .map(|item| decode_scalar(field, item.get("v").unwrap_or(&Value::Null)))
                .collect(),
        );
    }
    decode_scalar(field, value)
}

fn decode_scalar(field: &FieldSchema, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let text = value.as_str();
    match field.field_type.to_ascii_uppercase().as_str() {
        "RECORD" | "STRUCT" => Value::Object(decode_struct(&field.fields, value)),
        "INTEGER" | "INT64" => parse_incrementing(value)
            .map(Value::from)
            .unwrap_or_else(|| value.clone()),
        "FLOAT" | "FLOAT64" => text
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        "BOOLEAN" | "BOOL" => match text {
            Some("true") => Value::Bool(true),
            Some("false") => Value::Bool(false),
            _ => value.clone(),
        },
        "TIMESTAMP" => text
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(from_epoch_seconds)
            .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)))
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcbq_core::Watermark;

    fn fields() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("id", "INTEGER"),
            FieldSchema::new("score", "FLOAT"),
            FieldSchema::new("active", "BOOLEAN"),
            FieldSchema::new("updated_at", "TIMESTAMP"),
            FieldSchema::new("tags", "STRING").repeated(),
            FieldSchema::new("address", "RECORD")
                .with_fields(vec![FieldSchema::new("city", "STRING")]),
            FieldSchema::new("note", "STRING"),
        ]
    }

    #[test]
    fn decodes_typed_cells() {
        let rows = json!([{
            "f": [
                {"v": "42"},
                {"v": "1.5"},
                {"v": "true"},
                {"v": "1.7040672E9"},
                {"v": [{"v": "a"}, {"v": "b"}]},
                {"v": {"f": [{"v": "Berlin"}]}},
                {"v": null}
            ]
        }]);

        let decoded = decode_rows(&fields(), Some(&rows));
        assert_eq!(
            Value::Object(decoded[0].clone()),
            json!({
                "id": 42,
                "score": 1.5,
                "active": true,
                "updated_at": "2024-01-01T00:00:00.000000Z",
                "tags": ["a", "b"],
                "address": {"city": "Berlin"},
                "note": null
            })
        );
    }

    #[test]
    fn missing_rows_decode_to_nothing() {
        assert!(decode_rows(&fields(), None).is_empty());
        assert!(decode_rows(&fields(), Some(&json!(null))).is_empty());
    }

    #[test]
    fn error_reason_is_taken_from_the_envelope() {
        let body = r#"{"error":{"code":409,"message":"Already Exists: Table p:d.t","errors":[{"reason":"duplicate"}]}}"#;
        let err = error_from_body(409, body.to_string());
        assert!(err.is_already_exists());
        assert_eq!(err.reason.as_deref(), Some("duplicate"));

        let err = error_from_body(502, "<html>bad gateway</html>".to_string());
        assert_eq!(err.reason, None);
        assert!(err.body.contains("bad gateway"));
    }

    #[test]
    fn incremental_query_uses_named_parameters() {
        let query = IncrementalQuery {
            incrementing_column: "id".into(),
            timestamp_column: "updated_at".into(),
            watermark: Watermark::default(),
            limit: 100,
        };
        let body = incremental_query_body(&TableRef::new("p", "d", "t"), &query).unwrap();

        let sql = body["query"].as_str().unwrap();
        assert!(sql.starts_with("SELECT * FROM `p.d.t` WHERE `updated_at` > @last_timestamp"));
        assert!(sql.contains(
            "OR (`updated_at` = @last_timestamp AND `id` > @last_incrementing_value)"
        ));
        assert!(sql.ends_with("ORDER BY `updated_at` ASC, `id` ASC LIMIT 100"));
        assert_eq!(body["parameterMode"], "NAMED");
        assert_eq!(body["queryParameters"][0]["parameterValue"]["value"], "-1");
        assert_eq!(
            body["queryParameters"][1]["parameterValue"]["value"],
            "1970-01-01T00:00:00.000000Z"
        );
    }

    #[test]
    fn column_names_with_sql_are_rejected() {
        let query = IncrementalQuery {
            incrementing_column: "id` OR 1=1 --".into(),
            timestamp_column: "updated_at".into(),
            watermark: Watermark::default(),
            limit: 10,
        };
        assert!(incremental_query_body(&TableRef::new("p", "d", "t"), &query).is_err());
    }

    #[test]
    fn table_insert_body_carries_the_reference() {
        let description = TableDescription::new(vec![FieldSchema::new("id", "INTEGER")]);
        let body = table_insert_body(&TableRef::new("p", "d", "t"), &description).unwrap();
        assert_eq!(body["tableReference"]["tableId"], "t");
        assert_eq!(body["schema"]["fields"][0]["type"], "INTEGER");
        assert!(body.get("timePartitioning").is_none());
    }
}
