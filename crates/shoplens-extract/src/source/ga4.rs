//! GA4 event export in BigQuery
//!
//! GA4 writes one `events_YYYYMMDD` table per day into the export dataset.
//! A day is available once its table exists; a fetch runs one query over the
//! wildcard table and pages through the results with `getQueryResults`.

use crate::config::{ExtractConfig, Ga4Config};
use crate::error::{ExtractError, SourceError};
use crate::source::auth::TokenProvider;
use crate::source::http::{ApiClient, RetryPolicy};
use crate::source::{FetchWindow, Row, SourceAdapter, SourceKind, SourceProfile};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use shoplens_common::unit::ExtractionUnit;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery.readonly";

const PAGE_SIZE: u32 = 10_000;
const QUERY_TIMEOUT_MS: u32 = 60_000;
/// `getQueryResults` polls before an unfinished job is reported as an error
const MAX_POLLS: u32 = 30;

/// Source adapter for the GA4 BigQuery export
pub struct Ga4Source {
    config: Ga4Config,
    profile: SourceProfile,
    api: ApiClient,
}

impl Ga4Source {
    pub fn new(config: Ga4Config, shared: &ExtractConfig) -> Result<Self, ExtractError> {
        config.validate().map_err(ExtractError::Setup)?;
        let http = ApiClient::build_http(&shared.http)?;
        let tokens = TokenProvider::from_config(&shared.credentials, BIGQUERY_SCOPE, http.clone())?;
        let api = ApiClient::new(http, tokens, RetryPolicy::from_config(&shared.http));
        Ok(Self::with_client(config, api))
    }

    pub fn with_client(config: Ga4Config, api: ApiClient) -> Self {
        Self {
            config,
            profile: SourceProfile::for_kind(SourceKind::Ga4),
            api,
        }
    }

    fn api_root(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id
        )
    }

    fn events_query(&self, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            r#"SELECT
  event_date,
  event_name,
  event_timestamp,
  user_pseudo_id,
  user_id,
  event_bundle_sequence_id,
  device.category AS device_category,
  device.mobile_model_name AS device_model,
  device.mobile_brand_name AS device_brand,
  device.operating_system AS os,
  geo.country AS geo_country,
  geo.city AS geo_city,
  traffic_source.source AS traffic_source,
  traffic_source.medium AS traffic_medium,
  app_info.id AS app_id,
  app_info.version AS app_version,
  batch_event_index,
  batch_page_id,
  batch_ordering_id,
  is_active_user,
  TO_JSON_STRING(items) AS items_json,
  TO_JSON_STRING(event_params) AS event_params_json,
  TO_JSON_STRING(user_properties) AS user_properties_json,
  TO_JSON_STRING(user_ltv) AS user_ltv_json,
  TO_JSON_STRING(collected_traffic_source) AS collected_traffic_source_json,
  TO_JSON_STRING(session_traffic_source_last_click) AS session_traffic_source_last_click_json,
  publisher,
  TO_JSON_STRING(privacy_info) AS privacy_info_json
FROM `{project}.{dataset}.events_*`
WHERE _TABLE_SUFFIX BETWEEN '{start}' AND '{end}'
ORDER BY event_date, event_timestamp"#,
            project = self.config.project_id,
            dataset = self.config.dataset_id,
            start = start.format("%Y%m%d"),
            end = end.format("%Y%m%d"),
        )
    }
}

// BigQuery REST payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// BigQuery sends every scalar as a string; restore the column's type
fn typed_cell(field_type: &str, raw: Value) -> Value {
    let Value::String(text) = raw else {
        return raw;
    };
    match field_type {
        "INTEGER" | "INT64" => text.parse::<i64>().map(Value::from).unwrap_or(Value::String(text)),
        "FLOAT" | "FLOAT64" => text.parse::<f64>().map(Value::from).unwrap_or(Value::String(text)),
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

fn to_row(schema: &TableSchema, row: TableRow) -> Result<Row, SourceError> {
    let mut fields = Map::with_capacity(schema.fields.len());
    for (field, cell) in schema.fields.iter().zip(row.f) {
        fields.insert(field.name.clone(), typed_cell(&field.field_type, cell.v));
    }

    let event_date = fields
        .get("event_date")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::Decode("row without event_date".to_string()))?;
    let day = NaiveDate::parse_from_str(event_date, "%Y%m%d")
        .map_err(|_| SourceError::Decode(format!("invalid event_date: {}", event_date)))?;

    Ok(Row::new(ExtractionUnit::day(day), fields))
}

fn check_errors(response: &QueryResponse) -> Result<(), SourceError> {
    match response.errors.first() {
        Some(err) => Err(SourceError::Api(format!("{}: {}", err.reason, err.message))),
        None => Ok(()),
    }
}

#[async_trait]
impl SourceAdapter for Ga4Source {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("project_id".to_string(), self.config.project_id.clone()),
            ("dataset_id".to_string(), self.config.dataset_id.clone()),
        ])
    }

    async fn is_available(&self, unit: ExtractionUnit, _as_of: NaiveDate) -> Result<bool, SourceError> {
        let url = format!(
            "{}/datasets/{}/tables/events_{}",
            self.api_root(),
            self.config.dataset_id,
            unit.first_day().format("%Y%m%d")
        );
        let exists = self.api.exists("tables.get", |c| c.get(&url)).await?;
        debug!(%unit, exists, "Probed GA4 daily table");
        Ok(exists)
    }

    async fn fetch(&self, window: &FetchWindow, _dimensions: &[String]) -> Result<Vec<Row>, SourceError> {
        let (start, end) = (window.start_date(), window.end_date());
        info!("Extracting GA4 data: {} to {}", start, end);

        let query_url = format!("{}/queries", self.api_root());
        let body = json!({
            "query": self.events_query(start, end),
            "useLegacySql": false,
            "useQueryCache": true,
            "maxResults": PAGE_SIZE,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        let mut response: QueryResponse =
            self.api.json("jobs.query", |c| c.post(&query_url).json(&body)).await?;
        check_errors(&response)?;

        let job = response
            .job_reference
            .take()
            .ok_or_else(|| SourceError::Decode("query response without jobReference".to_string()))?;
        let results_url = format!("{}/queries/{}", self.api_root(), job.job_id);

        let mut schema = response.schema.clone();
        let mut rows = Vec::new();
        let mut bytes_processed = response.total_bytes_processed.clone();
        let mut polls = 0;

        loop {
            if response.job_complete {
                let table_schema = schema
                    .as_ref()
                    .ok_or_else(|| SourceError::Decode("query result without schema".to_string()))?;
                for row in std::mem::take(&mut response.rows) {
                    rows.push(to_row(table_schema, row)?);
                }
            }

            let page_token = response.page_token.take();
            if response.job_complete && page_token.is_none() {
                break;
            }
            if !response.job_complete {
                polls += 1;
                if polls > MAX_POLLS {
                    return Err(SourceError::Api(format!("query job {} did not complete", job.job_id)));
                }
            }

            let mut params: Vec<(&str, String)> = vec![
                ("maxResults", PAGE_SIZE.to_string()),
                ("timeoutMs", QUERY_TIMEOUT_MS.to_string()),
            ];
            if let Some(location) = &job.location {
                params.push(("location", location.clone()));
            }
            if let Some(token) = page_token {
                params.push(("pageToken", token));
            }

            response = self
                .api
                .json("jobs.getQueryResults", |c| c.get(&results_url).query(&params))
                .await?;
            check_errors(&response)?;
            if schema.is_none() {
                schema = response.schema.clone();
            }
            if bytes_processed.is_none() {
                bytes_processed = response.total_bytes_processed.clone();
            }
        }

        if let Some(bytes) = bytes_processed.and_then(|b| b.parse::<f64>().ok()) {
            info!("Query processed {:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0));
        }
        info!("Extracted {} events", rows.len());

        Ok(rows)
    }

    fn api_calls(&self) -> u64 {
        self.api.calls()
    }
}
