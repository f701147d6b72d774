//! Coverage report
//!
//! A read-only view of a ledger for operators: how much of the possible
//! range has been pulled, what is still missing, and what to run next.

use crate::ledger::{ApiErrorRecord, CoverageLedger};
use crate::planner::ExtractionMode;
use crate::source::{SourceKind, SourceProfile};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use shoplens_common::unit::{ExtractionUnit, Granularity};
use std::collections::BTreeMap;

/// Missing units listed in the report
const RECENT_MISSING: usize = 10;

/// Derived coverage statistics for one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub source: SourceKind,
    pub granularity: Granularity,
    pub as_of: NaiveDate,
    pub data_start_date: ExtractionUnit,
    pub latest_available_unit: ExtractionUnit,
    pub last_full_extraction: Option<DateTime<Utc>>,
    pub last_incremental_update: Option<DateTime<Utc>>,
    pub extracted_count: usize,
    pub total_possible: usize,
    pub coverage_percent: f64,
    pub missing_units_count: usize,
    /// The most recent missing units, oldest first
    pub recent_missing_units: Vec<ExtractionUnit>,
    pub total_api_calls: u64,
    pub last_api_error: Option<ApiErrorRecord>,
    pub source_identity: BTreeMap<String, String>,
    pub recommendations: Vec<String>,
}

/// Build the report for `ledger` with `as_of` as the last complete day
pub fn status(ledger: &CoverageLedger, profile: &SourceProfile, as_of: NaiveDate) -> CoverageReport {
    let start = ledger.data_start();
    let latest = profile.latest_unit(as_of);

    let total_possible = ExtractionUnit::count_inclusive(start, latest);
    let extracted_count = ledger.extracted_between(start, latest);
    let coverage_percent = if total_possible > 0 {
        round1(extracted_count as f64 / total_possible as f64 * 100.0)
    } else {
        0.0
    };

    let missing = ledger.missing_units(start, latest);
    let recent_missing_units = missing[missing.len().saturating_sub(RECENT_MISSING)..].to_vec();

    let recommendations = recommendations(ledger, profile, as_of, missing.len());

    CoverageReport {
        source: profile.kind,
        granularity: profile.granularity,
        as_of,
        data_start_date: start,
        latest_available_unit: latest,
        last_full_extraction: ledger.last_full_extraction(),
        last_incremental_update: ledger.last_incremental_update(),
        extracted_count,
        total_possible,
        coverage_percent,
        missing_units_count: missing.len(),
        recent_missing_units,
        total_api_calls: ledger.total_api_calls(),
        last_api_error: ledger.last_api_error().cloned(),
        source_identity: ledger.source_identity().clone(),
        recommendations,
    }
}

fn recommendations(
    ledger: &CoverageLedger,
    profile: &SourceProfile,
    as_of: NaiveDate,
    missing: usize,
) -> Vec<String> {
    let mut advice = Vec::new();
    let unit_name = match profile.granularity {
        Granularity::Day => "dates",
        Granularity::Month => "months",
    };

    if ledger.last_full_extraction().is_none() {
        advice.push(format!("Run full extraction first: --mode {}", ExtractionMode::Full));
    }

    if missing > RECENT_MISSING {
        advice.push(format!(
            "Many missing {} ({}). Consider: --mode {}",
            unit_name,
            missing,
            ExtractionMode::Smart
        ));
    } else if missing > 0 {
        advice.push(format!("Few missing {}. Run: --mode {}", unit_name, ExtractionMode::Smart));
    }

    if let Some(last_update) = ledger.last_incremental_update() {
        // Age is measured from the day after the last complete day
        let today = as_of.succ_opt().unwrap_or(as_of);
        let days_since = (today - last_update.date_naive()).num_days();
        if days_since > profile.stale_after_days {
            advice.push(format!("Consider an update (last: {} days ago)", days_since));
        }
    }

    advice
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
