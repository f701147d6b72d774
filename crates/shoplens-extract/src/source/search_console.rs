//! Search Console search analytics
//!
//! One `searchAnalytics/query` per month, paged with `startRow` until a
//! short page. The end date of the open month is clamped to the as-of date.

use crate::config::{ExtractConfig, SearchConsoleConfig};
use crate::error::{ExtractError, SourceError};
use crate::source::auth::TokenProvider;
use crate::source::http::{ApiClient, RetryPolicy};
use crate::source::{FetchWindow, Row, SourceAdapter, SourceKind, SourceProfile};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use shoplens_common::unit::ExtractionUnit;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const WEBMASTERS_SCOPE: &str = "https://www.googleapis.com/auth/webmasters.readonly";

/// Source adapter for the Search Console API
pub struct SearchConsoleSource {
    config: SearchConsoleConfig,
    profile: SourceProfile,
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<AnalyticsRow>,
}

#[derive(Debug, Deserialize)]
struct AnalyticsRow {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    clicks: f64,
    #[serde(default)]
    impressions: f64,
    #[serde(default)]
    ctr: f64,
    #[serde(default)]
    position: f64,
}

impl SearchConsoleSource {
    pub fn new(config: SearchConsoleConfig, shared: &ExtractConfig) -> Result<Self, ExtractError> {
        config.validate().map_err(ExtractError::Setup)?;
        let http = ApiClient::build_http(&shared.http)?;
        let tokens = TokenProvider::from_config(&shared.credentials, WEBMASTERS_SCOPE, http.clone())?;
        let api = ApiClient::new(http, tokens, RetryPolicy::from_config(&shared.http));
        Self::with_client(config, api)
    }

    pub fn with_client(config: SearchConsoleConfig, api: ApiClient) -> Result<Self, ExtractError> {
        // The site URL must form a valid path segment
        query_url(&config.base_url, &config.site_url)?;
        Ok(Self {
            config,
            profile: SourceProfile::for_kind(SourceKind::SearchConsole),
            api,
        })
    }

    /// Every row for `[start, end]`, following `startRow` pagination
    async fn query_period(
        &self,
        url: &Url,
        start: NaiveDate,
        end: NaiveDate,
        dimensions: &[String],
    ) -> Result<Vec<AnalyticsRow>, SourceError> {
        info!("Fetching data: {} to {}", start, end);

        let mut all_rows = Vec::new();
        let mut start_row: usize = 0;
        let mut requests = 0;

        loop {
            requests += 1;
            let body = json!({
                "startDate": start.format("%Y-%m-%d").to_string(),
                "endDate": end.format("%Y-%m-%d").to_string(),
                "dimensions": dimensions,
                "rowLimit": self.config.row_limit,
                "startRow": start_row,
            });

            let response: QueryResponse = self
                .api
                .json("searchAnalytics.query", |c| c.post(url.clone()).json(&body))
                .await?;

            let page_len = response.rows.len();
            if page_len == 0 {
                break;
            }
            all_rows.extend(response.rows);

            if page_len < self.config.row_limit as usize {
                break;
            }
            start_row += page_len;

            if requests % 5 == 0 {
                info!("Fetched {} rows so far...", all_rows.len());
            }
        }

        if all_rows.is_empty() {
            warn!("No data returned for period {} to {}", start, end);
        } else {
            info!("Processed {} rows from {} API requests", all_rows.len(), requests);
        }

        Ok(all_rows)
    }
}

fn query_url(base_url: &str, site_url: &str) -> Result<Url, ExtractError> {
    let invalid = |detail: String| ExtractError::setup(format!("Invalid Search Console URL: {}", detail));

    let mut url = Url::parse(base_url).map_err(|e| invalid(format!("{}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| invalid(base_url.to_string()))?
        .pop_if_empty()
        .extend(["webmasters", "v3", "sites", site_url, "searchAnalytics", "query"]);
    Ok(url)
}

fn to_row(month: ExtractionUnit, dimensions: &[String], row: AnalyticsRow) -> Row {
    let mut fields = Map::with_capacity(dimensions.len() + 4);
    for (dimension, key) in dimensions.iter().zip(row.keys) {
        fields.insert(dimension.clone(), Value::String(key));
    }
    fields.insert("clicks".into(), json!(row.clicks as i64));
    fields.insert("impressions".into(), json!(row.impressions as i64));
    fields.insert("ctr".into(), json!(row.ctr));
    fields.insert("position".into(), json!(row.position));
    Row::new(month, fields)
}

#[async_trait]
impl SourceAdapter for SearchConsoleSource {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("site_url".to_string(), self.config.site_url.clone())])
    }

    async fn is_available(&self, unit: ExtractionUnit, as_of: NaiveDate) -> Result<bool, SourceError> {
        Ok(unit.first_day() <= as_of)
    }

    async fn fetch(&self, window: &FetchWindow, dimensions: &[String]) -> Result<Vec<Row>, SourceError> {
        let dimensions = if dimensions.is_empty() {
            self.config.dimensions.as_slice()
        } else {
            dimensions
        };
        let url = query_url(&self.config.base_url, &self.config.site_url)
            .map_err(|e| SourceError::Api(e.to_string()))?;

        let mut rows = Vec::new();
        for month in window.units() {
            let start = month.first_day();
            let end = month.last_day().min(window.as_of);
            if start > end {
                continue;
            }

            let period = self.query_period(&url, start, end, dimensions).await?;
            rows.extend(period.into_iter().map(|row| to_row(month, dimensions, row)));
        }

        Ok(rows)
    }

    fn api_calls(&self) -> u64 {
        self.api.calls()
    }
}
