//! Source adapters
//!
//! A source adapter is the capability boundary between the extraction core
//! and one marketing API. The core only ever asks two things of it: whether a
//! unit has data upstream yet, and the complete row set for a unit range.
//! Pagination, field mapping and per-API quirks stay behind the trait.

pub mod auth;
pub mod ga4;
pub mod google_ads;
pub mod http;
pub mod search_console;

use crate::config::ExtractConfig;
use crate::error::{ExtractError, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use shoplens_common::unit::{ExtractionUnit, Granularity, UnitRange};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use ga4::Ga4Source;
pub use google_ads::GoogleAdsSource;
pub use search_console::SearchConsoleSource;

/// The marketing APIs extraction runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum SourceKind {
    /// GA4 event export in BigQuery
    Ga4,
    /// Google Ads keyword performance
    GoogleAds,
    /// Search Console search analytics
    SearchConsole,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Ga4 => write!(f, "ga4"),
            SourceKind::GoogleAds => write!(f, "google_ads"),
            SourceKind::SearchConsole => write!(f, "search_console"),
        }
    }
}

/// Static per-source parameters the planner and driver are generic over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub kind: SourceKind,
    pub granularity: Granularity,
    /// Days between a day ending and the API reporting it
    pub reporting_delay_days: u32,
    /// Window length of `last_n` mode, in units
    pub default_last_n: u32,
    /// Units per fetch when the caller does not choose
    pub default_batch_size: usize,
    /// Output table directory under the source's output path
    pub table_name: &'static str,
    /// Ledger file name inside the source's output path
    pub ledger_file: &'static str,
    /// Incremental updates older than this trigger a status recommendation
    pub stale_after_days: i64,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Pause before each fetch
    pub request_delay: Duration,
}

impl SourceProfile {
    pub fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Ga4 => Self {
                kind,
                granularity: Granularity::Day,
                reporting_delay_days: 0,
                default_last_n: 7,
                default_batch_size: 7,
                table_name: "analytics_events_final",
                ledger_file: ".ga4_extraction_metadata.json",
                stale_after_days: 1,
                batch_delay: Duration::ZERO,
                request_delay: Duration::ZERO,
            },
            SourceKind::GoogleAds => Self {
                kind,
                granularity: Granularity::Day,
                reporting_delay_days: 3,
                default_last_n: 7,
                default_batch_size: 7,
                table_name: "google_ads_final",
                ledger_file: ".google_ads_extraction_metadata.json",
                stale_after_days: 3,
                batch_delay: Duration::from_secs(1),
                request_delay: Duration::from_millis(100),
            },
            SourceKind::SearchConsole => Self {
                kind,
                granularity: Granularity::Month,
                reporting_delay_days: 0,
                default_last_n: 3,
                default_batch_size: 1,
                table_name: "search_console_final",
                ledger_file: ".extraction_metadata.json",
                stale_after_days: 7,
                batch_delay: Duration::ZERO,
                request_delay: Duration::ZERO,
            },
        }
    }

    /// Newest unit the API can have data for as of `as_of`
    pub fn latest_unit(&self, as_of: NaiveDate) -> ExtractionUnit {
        let reported = as_of
            .checked_sub_days(chrono::Days::new(u64::from(self.reporting_delay_days)))
            .unwrap_or(as_of);
        ExtractionUnit::containing(self.granularity, reported)
    }

    /// Month still receiving data upstream: the one holding the latest unit
    pub fn open_period(&self, as_of: NaiveDate) -> ExtractionUnit {
        ExtractionUnit::month_of(self.latest_unit(as_of).first_day())
    }
}

/// One extracted row, tagged with the unit it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub unit: ExtractionUnit,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Row {
    pub fn new(unit: ExtractionUnit, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { unit, fields }
    }

    /// Partition month (`YYYYMM`) the row is written under
    pub fn report_month(&self) -> String {
        self.unit.report_month()
    }
}

/// Inclusive unit range handed to [`SourceAdapter::fetch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub first: ExtractionUnit,
    pub last: ExtractionUnit,
    /// No date after this is requested from the API
    pub as_of: NaiveDate,
}

impl FetchWindow {
    pub fn new(first: ExtractionUnit, last: ExtractionUnit, as_of: NaiveDate) -> Self {
        Self { first, last, as_of }
    }

    pub fn start_date(&self) -> NaiveDate {
        self.first.first_day()
    }

    /// Last requested date, clamped to the as-of date
    pub fn end_date(&self) -> NaiveDate {
        self.last.last_day().min(self.as_of)
    }

    pub fn units(&self) -> UnitRange {
        ExtractionUnit::range_inclusive(self.first, self.last)
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.first, self.last)
    }
}

/// Capability interface every marketing API implements
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn profile(&self) -> &SourceProfile;

    /// Descriptive identifiers (project, customer, site) recorded in the ledger
    fn identity(&self) -> BTreeMap<String, String>;

    /// Cheap existence probe for one unit, as seen on `as_of`
    async fn is_available(
        &self,
        unit: ExtractionUnit,
        as_of: NaiveDate,
    ) -> Result<bool, SourceError>;

    /// Complete row set for the window, or an error. Never a truncated result.
    async fn fetch(
        &self,
        window: &FetchWindow,
        dimensions: &[String],
    ) -> Result<Vec<Row>, SourceError>;

    /// Underlying API calls made so far
    fn api_calls(&self) -> u64 {
        0
    }
}

/// Build the adapter for `kind` from configuration
pub fn build_source(
    kind: SourceKind,
    config: &ExtractConfig,
) -> Result<Arc<dyn SourceAdapter>, ExtractError> {
    let adapter: Arc<dyn SourceAdapter> = match kind {
        SourceKind::Ga4 => Arc::new(Ga4Source::new(config.ga4.clone(), config)?),
        SourceKind::GoogleAds => {
            Arc::new(GoogleAdsSource::new(config.google_ads.clone(), config)?)
        },
        SourceKind::SearchConsole => {
            Arc::new(SearchConsoleSource::new(config.search_console.clone(), config)?)
        },
    };
    Ok(adapter)
}
