//! Extraction configuration

use crate::error::{ExtractError, Result};
use crate::source::SourceKind;
use serde::{Deserialize, Serialize};
use shoplens_common::unit::{ExtractionUnit, Granularity};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_GA4_BASE_URL: &str = "https://bigquery.googleapis.com";
pub const DEFAULT_GOOGLE_ADS_BASE_URL: &str = "https://googleads.googleapis.com";
pub const DEFAULT_GOOGLE_ADS_API_VERSION: &str = "v18";
pub const DEFAULT_SEARCH_CONSOLE_BASE_URL: &str = "https://searchconsole.googleapis.com";
pub const DEFAULT_SEARCH_CONSOLE_DIMENSIONS: &[&str] = &["query", "page", "country", "device", "date"];

/// Credential material for the Google APIs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Path to a service account JSON key
    pub service_account_key_path: Option<PathBuf>,

    /// Pre-minted OAuth access token, preferred over the key file
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

/// HTTP client settings shared by all adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Attempts per network call, including the first
    pub max_retries: u32,

    /// Backoff before the second attempt, doubled for each further attempt
    pub backoff_base_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 3,
            backoff_base_ms: 1000,
        }
    }
}

/// GA4 export in BigQuery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ga4Config {
    pub project_id: String,
    pub dataset_id: String,
    pub output_path: PathBuf,
    pub data_start: ExtractionUnit,
    pub base_url: String,
}

/// Google Ads keyword performance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleAdsConfig {
    pub customer_id: String,
    pub login_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub developer_token: String,
    pub output_path: PathBuf,
    pub data_start: ExtractionUnit,
    pub base_url: String,
    pub api_version: String,
    pub campaign_id: Option<String>,
    pub ad_group_id: Option<String>,
}

/// Search Console search analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConsoleConfig {
    pub site_url: String,
    pub output_path: PathBuf,
    pub data_start: ExtractionUnit,
    pub base_url: String,
    pub dimensions: Vec<String>,
    /// Rows per searchAnalytics page
    pub row_limit: u32,
}

/// Everything an extraction run needs, assembled once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub data_dir: PathBuf,
    pub credentials: CredentialsConfig,
    pub http: HttpConfig,
    pub ga4: Ga4Config,
    pub google_ads: GoogleAdsConfig,
    pub search_console: SearchConsoleConfig,
}

impl ExtractConfig {
    /// Configuration rooted at `data_dir` with every other value at its default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            credentials: CredentialsConfig::default(),
            http: HttpConfig::default(),
            ga4: Ga4Config {
                project_id: String::new(),
                dataset_id: String::new(),
                output_path: data_dir.join("ga4"),
                data_start: ExtractionUnit::Day(ymd(2025, 3, 1)),
                base_url: DEFAULT_GA4_BASE_URL.to_string(),
            },
            google_ads: GoogleAdsConfig {
                customer_id: String::new(),
                login_customer_id: None,
                developer_token: String::new(),
                output_path: data_dir.join("google_ads"),
                data_start: ExtractionUnit::Day(ymd(2025, 1, 1)),
                base_url: DEFAULT_GOOGLE_ADS_BASE_URL.to_string(),
                api_version: DEFAULT_GOOGLE_ADS_API_VERSION.to_string(),
                campaign_id: None,
                ad_group_id: None,
            },
            search_console: SearchConsoleConfig {
                site_url: "sc-domain:pops.studio".to_string(),
                output_path: data_dir.join("search_console"),
                data_start: ExtractionUnit::Month(ymd(2024, 7, 1)),
                base_url: DEFAULT_SEARCH_CONSOLE_BASE_URL.to_string(),
                dimensions: DEFAULT_SEARCH_CONSOLE_DIMENSIONS
                    .iter()
                    .map(|d| d.to_string())
                    .collect(),
                row_limit: 25_000,
            },
            data_dir,
        }
    }
}

impl ExtractConfig {
    /// Output directory of one source; its table and ledger live inside it
    pub fn output_path(&self, kind: SourceKind) -> &Path {
        match kind {
            SourceKind::Ga4 => &self.ga4.output_path,
            SourceKind::GoogleAds => &self.google_ads.output_path,
            SourceKind::SearchConsole => &self.search_console.output_path,
        }
    }

    /// Earliest unit a source can have data for
    pub fn data_start(&self, kind: SourceKind) -> ExtractionUnit {
        match kind {
            SourceKind::Ga4 => self.ga4.data_start,
            SourceKind::GoogleAds => self.google_ads.data_start,
            SourceKind::SearchConsole => self.search_console.data_start,
        }
    }
}

fn ymd(year: i32, month: u32, day: u32) -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

// ============================================================================
// Environment Variable Support
// ============================================================================

impl ExtractConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparseable values are
    /// setup errors.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("SHOPLENS_DATA_DIR").unwrap_or_else(|_| "./data_repo".to_string());
        let mut config = Self::with_data_dir(data_dir);

        config.credentials = CredentialsConfig {
            service_account_key_path: env_opt("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            access_token: env_opt("GOOGLE_OAUTH_ACCESS_TOKEN"),
        };

        config.http.timeout_secs = env_parse("SHOPLENS_HTTP_TIMEOUT_SECS", config.http.timeout_secs)?;
        config.http.max_retries = env_parse("SHOPLENS_MAX_RETRIES", config.http.max_retries)?;
        config.http.backoff_base_ms = env_parse("SHOPLENS_BACKOFF_BASE_MS", config.http.backoff_base_ms)?;

        let ga4 = &mut config.ga4;
        ga4.project_id = env_opt("GOOGLE_CLOUD_PROJECT").unwrap_or_default();
        ga4.dataset_id = env_opt("BIGQUERY_DATASET_ID").unwrap_or_default();
        if let Some(path) = env_opt("GA4_OUTPUT_PATH") {
            ga4.output_path = PathBuf::from(path);
        }
        ga4.data_start = env_unit("GA4_DATA_START_DATE", ga4.data_start, Granularity::Day)?;
        if let Some(url) = env_opt("GA4_BASE_URL") {
            ga4.base_url = url;
        }

        let ads = &mut config.google_ads;
        ads.customer_id = env_opt("GOOGLE_ADS_CUSTOMER_ID")
            .map(|id| id.replace('-', ""))
            .unwrap_or_default();
        ads.login_customer_id = env_opt("GOOGLE_ADS_LOGIN_CUSTOMER_ID").map(|id| id.replace('-', ""));
        ads.developer_token = env_opt("GOOGLE_ADS_DEVELOPER_TOKEN").unwrap_or_default();
        if let Some(path) = env_opt("GOOGLE_ADS_OUTPUT_PATH") {
            ads.output_path = PathBuf::from(path);
        }
        ads.data_start = env_unit("GOOGLE_ADS_DATA_START_DATE", ads.data_start, Granularity::Day)?;
        if let Some(url) = env_opt("GOOGLE_ADS_BASE_URL") {
            ads.base_url = url;
        }
        if let Some(version) = env_opt("GOOGLE_ADS_API_VERSION") {
            ads.api_version = version;
        }

        let sc = &mut config.search_console;
        if let Some(site) = env_opt("SEARCH_CONSOLE_SITE_URL") {
            sc.site_url = site;
        }
        if let Some(path) = env_opt("SEARCH_CONSOLE_OUTPUT_PATH") {
            sc.output_path = PathBuf::from(path);
        }
        sc.data_start = env_unit("SEARCH_CONSOLE_DATA_START_MONTH", sc.data_start, Granularity::Month)?;
        if let Some(url) = env_opt("SEARCH_CONSOLE_BASE_URL") {
            sc.base_url = url;
        }
        if let Some(dims) = env_opt("SEARCH_CONSOLE_DIMENSIONS") {
            sc.dimensions = split_list(&dims);
        }

        Ok(config)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ExtractError::setup(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

fn env_unit(key: &str, default: ExtractionUnit, granularity: Granularity) -> Result<ExtractionUnit> {
    let unit = env_parse(key, default)?;
    if unit.granularity() != granularity {
        return Err(ExtractError::setup(format!(
            "{} must be a {} (got {})",
            key, granularity, unit
        )));
    }
    Ok(unit)
}

/// Split a comma separated list, dropping blanks
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Validation
// ============================================================================

impl CredentialsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.access_token.is_none() && self.service_account_key_path.is_none() {
            return Err(
                "No credentials: set GOOGLE_OAUTH_ACCESS_TOKEN or GOOGLE_APPLICATION_CREDENTIALS"
                    .to_string(),
            );
        }
        Ok(())
    }
}

impl HttpConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.timeout_secs == 0 {
            return Err("HTTP timeout must be greater than 0".to_string());
        }
        if self.max_retries == 0 {
            return Err("Max retries must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Ga4Config {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.project_id.is_empty() {
            return Err("GOOGLE_CLOUD_PROJECT is not set".to_string());
        }
        if self.dataset_id.is_empty() {
            return Err("BIGQUERY_DATASET_ID is not set".to_string());
        }
        if self.base_url.is_empty() {
            return Err("GA4 base URL cannot be empty".to_string());
        }
        Ok(())
    }
}

impl GoogleAdsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.customer_id.is_empty() {
            return Err("GOOGLE_ADS_CUSTOMER_ID is not set".to_string());
        }
        if !self.customer_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Invalid Google Ads customer id: {}", self.customer_id));
        }
        if self.developer_token.is_empty() {
            return Err("GOOGLE_ADS_DEVELOPER_TOKEN is not set".to_string());
        }
        if self.api_version.is_empty() {
            return Err("Google Ads API version cannot be empty".to_string());
        }
        for (name, id) in [("campaign", &self.campaign_id), ("ad group", &self.ad_group_id)] {
            if let Some(id) = id {
                if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("Invalid {} id filter: {}", name, id));
                }
            }
        }
        Ok(())
    }
}

impl SearchConsoleConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.site_url.is_empty() {
            return Err("SEARCH_CONSOLE_SITE_URL cannot be empty".to_string());
        }
        if self.dimensions.is_empty() {
            return Err("At least one Search Console dimension is required".to_string());
        }
        if self.row_limit == 0 || self.row_limit > 25_000 {
            return Err(format!("Row limit must be in 1..=25000, got {}", self.row_limit));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "SHOPLENS_DATA_DIR",
        "GOOGLE_APPLICATION_CREDENTIALS",
        "GOOGLE_OAUTH_ACCESS_TOKEN",
        "SHOPLENS_MAX_RETRIES",
        "GOOGLE_CLOUD_PROJECT",
        "BIGQUERY_DATASET_ID",
        "GA4_DATA_START_DATE",
        "GOOGLE_ADS_CUSTOMER_ID",
        "SEARCH_CONSOLE_DATA_START_MONTH",
        "SEARCH_CONSOLE_DIMENSIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = ExtractConfig::with_data_dir("/tmp/data");
        assert_eq!(config.ga4.output_path, PathBuf::from("/tmp/data/ga4"));
        assert_eq!(config.ga4.data_start.to_string(), "2025-03-01");
        assert_eq!(config.google_ads.data_start.to_string(), "2025-01-01");
        assert_eq!(config.search_console.data_start.to_string(), "202407");
        assert_eq!(config.search_console.dimensions.len(), 5);
        assert_eq!(config.http.max_retries, 3);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("SHOPLENS_DATA_DIR", "/srv/shoplens");
        std::env::set_var("GOOGLE_CLOUD_PROJECT", "shop-analytics");
        std::env::set_var("GOOGLE_ADS_CUSTOMER_ID", "123-456-7890");
        std::env::set_var("SEARCH_CONSOLE_DIMENSIONS", "query, page");

        let config = ExtractConfig::from_env().unwrap();
        assert_eq!(config.ga4.output_path, PathBuf::from("/srv/shoplens/ga4"));
        assert_eq!(config.ga4.project_id, "shop-analytics");
        assert_eq!(config.google_ads.customer_id, "1234567890");
        assert_eq!(config.search_console.dimensions, vec!["query", "page"]);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        std::env::set_var("SEARCH_CONSOLE_DATA_START_MONTH", "2024-07-01");
        let err = ExtractConfig::from_env().unwrap_err();
        assert!(matches!(err, ExtractError::Setup(_)));

        clear_env();
        std::env::set_var("SHOPLENS_MAX_RETRIES", "lots");
        assert!(ExtractConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn test_validation() {
        let mut config = ExtractConfig::with_data_dir("/tmp/data");
        assert!(config.credentials.validate().is_err());
        assert!(config.ga4.validate().is_err());

        config.credentials.access_token = Some("token".to_string());
        config.ga4.project_id = "p".to_string();
        config.ga4.dataset_id = "analytics_123".to_string();
        assert!(config.credentials.validate().is_ok());
        assert!(config.ga4.validate().is_ok());

        config.google_ads.customer_id = "1234567890".to_string();
        config.google_ads.developer_token = "dev".to_string();
        assert!(config.google_ads.validate().is_ok());
        config.google_ads.campaign_id = Some("1 OR 1=1".to_string());
        assert!(config.google_ads.validate().is_err());
        config.google_ads.campaign_id = None;
        config.google_ads.customer_id = "12ab".to_string();
        assert!(config.google_ads.validate().is_err());

        config.search_console.row_limit = 30_000;
        assert!(config.search_console.validate().is_err());
    }
}
