//! Google Ads keyword performance
//!
//! One `googleAds:searchStream` call per fetch window. The stream endpoint
//! returns every result batch in a single JSON array, so there is no
//! pagination to follow.

use crate::config::{ExtractConfig, GoogleAdsConfig};
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
use tracing::info;

pub const ADWORDS_SCOPE: &str = "https://www.googleapis.com/auth/adwords";

const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Source adapter for the Google Ads API
pub struct GoogleAdsSource {
    config: GoogleAdsConfig,
    profile: SourceProfile,
    api: ApiClient,
}

impl GoogleAdsSource {
    pub fn new(config: GoogleAdsConfig, shared: &ExtractConfig) -> Result<Self, ExtractError> {
        config.validate().map_err(ExtractError::Setup)?;
        let http = ApiClient::build_http(&shared.http)?;
        let tokens = TokenProvider::from_config(&shared.credentials, ADWORDS_SCOPE, http.clone())?;
        let api = ApiClient::new(http, tokens, RetryPolicy::from_config(&shared.http));
        Ok(Self::with_client(config, api))
    }

    pub fn with_client(config: GoogleAdsConfig, api: ApiClient) -> Self {
        Self {
            config,
            profile: SourceProfile::for_kind(SourceKind::GoogleAds),
            api,
        }
    }

    fn gaql(&self, start: NaiveDate, end: NaiveDate) -> String {
        let mut query = format!(
            "SELECT campaign.id, campaign.name, campaign.status, \
             ad_group.id, ad_group.name, ad_group.status, \
             ad_group_criterion.criterion_id, ad_group_criterion.keyword.text, \
             ad_group_criterion.keyword.match_type, ad_group_criterion.status, \
             metrics.impressions, metrics.clicks, metrics.average_cpc, metrics.ctr, \
             metrics.conversions, metrics.conversions_value, metrics.cost_micros, \
             metrics.value_per_conversion, metrics.average_cpm, \
             segments.date, segments.day_of_week, segments.device \
             FROM keyword_view \
             WHERE segments.date BETWEEN '{}' AND '{}'",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        if let Some(campaign_id) = &self.config.campaign_id {
            query.push_str(&format!(" AND campaign.id = {}", campaign_id));
        }
        if let Some(ad_group_id) = &self.config.ad_group_id {
            query.push_str(&format!(" AND ad_group.id = {}", ad_group_id));
        }
        query.push_str(" ORDER BY segments.date, campaign.id, ad_group.id");
        query
    }
}

#[derive(Debug, Deserialize)]
struct StreamBatch {
    #[serde(default)]
    results: Vec<Value>,
}

static NULL: Value = Value::Null;

/// Walk a dotted path through nested objects
fn lookup<'a>(value: &'a Value, dotted: &str) -> &'a Value {
    dotted
        .split('.')
        .fold(value, |node, key| node.get(key).unwrap_or(&NULL))
}

/// int64 fields arrive as JSON strings
fn integer(value: &Value) -> Value {
    match value {
        Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        Value::Number(_) => value.clone(),
        _ => json!(0),
    }
}

fn number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn from_micros(value: &Value) -> Value {
    json!(number(value) / MICROS_PER_UNIT)
}

fn to_row(result: &Value) -> Result<Row, SourceError> {
    let date = lookup(result, "segments.date")
        .as_str()
        .ok_or_else(|| SourceError::Decode("result without segments.date".to_string()))?;
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| SourceError::Decode(format!("invalid segments.date: {}", date)))?;

    let text = |path: &str| lookup(result, path).clone();
    let mut fields = Map::new();
    fields.insert("campaign_id".into(), integer(lookup(result, "campaign.id")));
    fields.insert("campaign_name".into(), text("campaign.name"));
    fields.insert("campaign_status".into(), text("campaign.status"));
    fields.insert("ad_group_id".into(), integer(lookup(result, "adGroup.id")));
    fields.insert("ad_group_name".into(), text("adGroup.name"));
    fields.insert("ad_group_status".into(), text("adGroup.status"));
    fields.insert(
        "criterion_id".into(),
        integer(lookup(result, "adGroupCriterion.criterionId")),
    );
    fields.insert("keyword_text".into(), text("adGroupCriterion.keyword.text"));
    fields.insert("match_type".into(), text("adGroupCriterion.keyword.matchType"));
    fields.insert("criterion_status".into(), text("adGroupCriterion.status"));
    fields.insert("impressions".into(), integer(lookup(result, "metrics.impressions")));
    fields.insert("clicks".into(), integer(lookup(result, "metrics.clicks")));
    fields.insert("average_cpc".into(), from_micros(lookup(result, "metrics.averageCpc")));
    fields.insert("ctr".into(), json!(number(lookup(result, "metrics.ctr"))));
    fields.insert("conversions".into(), json!(number(lookup(result, "metrics.conversions"))));
    fields.insert(
        "conversions_value".into(),
        json!(number(lookup(result, "metrics.conversionsValue"))),
    );
    fields.insert("cost".into(), from_micros(lookup(result, "metrics.costMicros")));
    fields.insert(
        "value_per_conversion".into(),
        json!(number(lookup(result, "metrics.valuePerConversion"))),
    );
    fields.insert("average_cpm".into(), from_micros(lookup(result, "metrics.averageCpm")));
    fields.insert("date".into(), Value::String(date.to_string()));
    fields.insert("day_of_week".into(), text("segments.dayOfWeek"));
    fields.insert("device".into(), text("segments.device"));

    Ok(Row::new(ExtractionUnit::day(day), fields))
}

#[async_trait]
impl SourceAdapter for GoogleAdsSource {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    fn identity(&self) -> BTreeMap<String, String> {
        let mut identity = BTreeMap::from([("customer_id".to_string(), self.config.customer_id.clone())]);
        if let Some(login) = &self.config.login_customer_id {
            identity.insert("login_customer_id".to_string(), login.clone());
        }
        identity
    }

    /// Ads reports lag three days behind; no probe call is needed
    async fn is_available(&self, unit: ExtractionUnit, as_of: NaiveDate) -> Result<bool, SourceError> {
        Ok(unit <= self.profile.latest_unit(as_of))
    }

    async fn fetch(&self, window: &FetchWindow, _dimensions: &[String]) -> Result<Vec<Row>, SourceError> {
        let (start, end) = (window.start_date(), window.end_date());
        info!("Extracting Google Ads data: {} to {}", start, end);

        let url = format!(
            "{}/{}/customers/{}/googleAds:searchStream",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            self.config.customer_id
        );
        let body = json!({ "query": self.gaql(start, end) });

        let batches: Vec<StreamBatch> = self
            .api
            .json("googleAds:searchStream", |c| {
                let request = c
                    .post(&url)
                    .header("developer-token", &self.config.developer_token)
                    .json(&body);
                match &self.config.login_customer_id {
                    Some(login) => request.header("login-customer-id", login),
                    None => request,
                }
            })
            .await?;

        let rows = batches
            .iter()
            .flat_map(|batch| batch.results.iter())
            .map(to_row)
            .collect::<Result<Vec<_>, _>>()?;

        info!("Extracted {} keyword records", rows.len());
        Ok(rows)
    }

    fn api_calls(&self) -> u64 {
        self.api.calls()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::Client;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer, campaign_id: Option<&str>) -> GoogleAdsSource {
        let mut config = ExtractConfig::with_data_dir("/tmp/unused").google_ads;
        config.customer_id = "1234567890".to_string();
        config.login_customer_id = Some("9876543210".to_string());
        config.developer_token = "dev-token".to_string();
        config.base_url = server.uri();
        config.campaign_id = campaign_id.map(str::to_string);
        let api = ApiClient::new(
            Client::new(),
            TokenProvider::static_token("token"),
            RetryPolicy { max_attempts: 1, base_delay: Duration::ZERO },
        );
        GoogleAdsSource::with_client(config, api)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn result(day: &str, cost_micros: &str) -> Value {
        json!({
            "campaign": {"id": "111", "name": "Brand", "status": "ENABLED"},
            "adGroup": {"id": "222", "name": "Mugs", "status": "ENABLED"},
            "adGroupCriterion": {
                "criterionId": "333",
                "keyword": {"text": "ceramic mug", "matchType": "PHRASE"},
                "status": "ENABLED"
            },
            "metrics": {
                "impressions": "120",
                "clicks": "7",
                "averageCpc": 450000.0,
                "ctr": 0.0583,
                "conversions": 1.0,
                "conversionsValue": 32.5,
                "costMicros": cost_micros,
                "averageCpm": 26250000.0
            },
            "segments": {"date": day, "dayOfWeek": "MONDAY", "device": "MOBILE"}
        })
    }

    #[tokio::test]
    async fn test_availability_respects_reporting_delay() {
        let server = MockServer::start().await;
        let ads = source(&server, None);
        let as_of = date("2025-06-10");

        assert!(ads.is_available("2025-06-07".parse().unwrap(), as_of).await.unwrap());
        assert!(!ads.is_available("2025-06-08".parse().unwrap(), as_of).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_maps_stream_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v18/customers/1234567890/googleAds:searchStream"))
            .and(header("developer-token", "dev-token"))
            .and(header("login-customer-id", "9876543210"))
            .and(body_string_contains("campaign.id = 111"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"results": [result("2025-06-01", "3150000")]},
                {"results": [result("2025-06-02", "0")]}
            ])))
            .mount(&server)
            .await;

        let ads = source(&server, Some("111"));
        let window = FetchWindow::new(
            "2025-06-01".parse().unwrap(),
            "2025-06-02".parse().unwrap(),
            date("2025-06-10"),
        );
        let rows = ads.fetch(&window, &[]).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].unit.to_string(), "2025-06-01");
        assert_eq!(rows[0].fields["cost"], json!(3.15));
        assert_eq!(rows[0].fields["average_cpc"], json!(0.45));
        assert_eq!(rows[0].fields["impressions"], json!(120));
        assert_eq!(rows[0].fields["keyword_text"], "ceramic mug");
        assert_eq!(rows[1].fields["cost"], json!(0.0));
        assert_eq!(ads.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream_is_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v18/customers/1234567890/googleAds:searchStream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let ads = source(&server, None);
        let day: ExtractionUnit = "2025-06-01".parse().unwrap();
        let rows = ads.fetch(&FetchWindow::new(day, day, date("2025-06-10")), &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_gaql_filters() {
        let server_free = GoogleAdsSource::with_client(
            {
                let mut config = ExtractConfig::with_data_dir("/tmp/unused").google_ads;
                config.ad_group_id = Some("42".to_string());
                config
            },
            ApiClient::new(Client::new(), TokenProvider::static_token("t"), RetryPolicy::default()),
        );
        let query = server_free.gaql(date("2025-06-01"), date("2025-06-07"));
        assert!(query.contains("BETWEEN '2025-06-01' AND '2025-06-07'"));
        assert!(query.contains("AND ad_group.id = 42"));
        assert!(!query.contains("campaign.id = "));
        assert!(query.ends_with("ORDER BY segments.date, campaign.id, ad_group.id"));
    }
}
