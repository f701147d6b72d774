//! Coverage ledger
//!
//! The ledger is the single record of which units have been pulled from a
//! source. It lives in one JSON file inside the source's output directory,
//! is loaded at the start of a run, mutated in memory as batches succeed, and
//! saved once at the end.
//!
//! A missing, malformed, or foreign ledger file never fails a run: it is
//! replaced by an empty ledger and a warning. The worst outcome is that
//! already extracted units get fetched again.

use crate::error::LedgerError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shoplens_common::unit::{ExtractionUnit, Granularity};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which timestamp a finished run stamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    Incremental,
}

/// The most recent fetch failure, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub unit_range: String,
}

/// The open month and the last complete day it was fully rewritten through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRefresh {
    pub period: ExtractionUnit,
    pub as_of: NaiveDate,
}

/// Per-source record of extracted units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageLedger {
    #[serde(default)]
    extracted_units: BTreeSet<ExtractionUnit>,

    /// Partition months with at least one extracted unit
    #[serde(default)]
    extracted_months: BTreeSet<String>,

    #[serde(default)]
    last_full_extraction: Option<DateTime<Utc>>,

    #[serde(default)]
    last_incremental_update: Option<DateTime<Utc>>,

    /// Project, customer or site the units were pulled from
    #[serde(default)]
    source_identity: BTreeMap<String, String>,

    #[serde(rename = "data_start_date")]
    data_start: ExtractionUnit,

    #[serde(default)]
    total_api_calls: u64,

    #[serde(default)]
    last_api_error: Option<ApiErrorRecord>,

    #[serde(default, rename = "current_period_refreshed")]
    open_period_refresh: Option<PeriodRefresh>,
}

impl CoverageLedger {
    /// Empty ledger for a source whose data begins at `data_start`
    pub fn new(data_start: ExtractionUnit) -> Self {
        Self {
            extracted_units: BTreeSet::new(),
            extracted_months: BTreeSet::new(),
            last_full_extraction: None,
            last_incremental_update: None,
            source_identity: BTreeMap::new(),
            data_start,
            total_api_calls: 0,
            last_api_error: None,
            open_period_refresh: None,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.data_start.granularity()
    }

    pub fn data_start(&self) -> ExtractionUnit {
        self.data_start
    }

    pub fn is_extracted(&self, unit: ExtractionUnit) -> bool {
        self.extracted_units.contains(&unit)
    }

    /// Record `unit` as extracted. Idempotent.
    pub fn mark_extracted(&mut self, unit: ExtractionUnit) {
        if unit.granularity() != self.granularity() {
            warn!(%unit, expected = %self.granularity(), "Ignoring unit of the wrong granularity");
            return;
        }
        self.extracted_months.insert(unit.report_month());
        self.extracted_units.insert(unit);
    }

    /// Drop `unit` from the extracted set, e.g. after its rows were replaced
    pub fn forget(&mut self, unit: ExtractionUnit) {
        if !self.extracted_units.remove(&unit) {
            return;
        }
        let month = unit.report_month();
        if !self.extracted_units.iter().any(|u| u.report_month() == month) {
            self.extracted_months.remove(&month);
        }
    }

    /// Units in `[start, end]` not yet extracted, oldest first
    pub fn missing_units(&self, start: ExtractionUnit, end: ExtractionUnit) -> Vec<ExtractionUnit> {
        ExtractionUnit::range_inclusive(start, end)
            .filter(|unit| !self.extracted_units.contains(unit))
            .collect()
    }

    /// Extracted units in `[start, end]`
    pub fn extracted_between(&self, start: ExtractionUnit, end: ExtractionUnit) -> usize {
        if start > end {
            return 0;
        }
        self.extracted_units.range(start..=end).count()
    }

    pub fn extracted_units(&self) -> impl Iterator<Item = &ExtractionUnit> {
        self.extracted_units.iter()
    }

    pub fn extracted_count(&self) -> usize {
        self.extracted_units.len()
    }

    pub fn extracted_months(&self) -> &BTreeSet<String> {
        &self.extracted_months
    }

    /// Stamp the timestamp for `kind` with the current time
    pub fn record_run(&mut self, kind: RunKind) {
        self.record_run_at(kind, Utc::now());
    }

    pub fn record_run_at(&mut self, kind: RunKind, at: DateTime<Utc>) {
        match kind {
            RunKind::Full => self.last_full_extraction = Some(at),
            RunKind::Incremental => self.last_incremental_update = Some(at),
        }
    }

    pub fn last_full_extraction(&self) -> Option<DateTime<Utc>> {
        self.last_full_extraction
    }

    pub fn last_incremental_update(&self) -> Option<DateTime<Utc>> {
        self.last_incremental_update
    }

    pub fn set_source_identity(&mut self, identity: BTreeMap<String, String>) {
        self.source_identity = identity;
    }

    pub fn source_identity(&self) -> &BTreeMap<String, String> {
        &self.source_identity
    }

    pub fn record_api_calls(&mut self, calls: u64) {
        self.total_api_calls = self.total_api_calls.saturating_add(calls);
    }

    pub fn total_api_calls(&self) -> u64 {
        self.total_api_calls
    }

    pub fn record_api_error(&mut self, error: impl Into<String>, unit_range: impl Into<String>) {
        self.last_api_error = Some(ApiErrorRecord {
            timestamp: Utc::now(),
            error: error.into(),
            unit_range: unit_range.into(),
        });
    }

    pub fn last_api_error(&self) -> Option<&ApiErrorRecord> {
        self.last_api_error.as_ref()
    }

    /// Whether `period` was already rewritten in full through `as_of`
    pub fn open_period_refreshed(&self, period: ExtractionUnit, as_of: NaiveDate) -> bool {
        self.open_period_refresh
            .is_some_and(|refresh| refresh.period == period && refresh.as_of >= as_of)
    }

    pub fn record_open_period_refresh(&mut self, period: ExtractionUnit, as_of: NaiveDate) {
        self.open_period_refresh = Some(PeriodRefresh { period, as_of });
    }

    pub fn open_period_refresh(&self) -> Option<&PeriodRefresh> {
        self.open_period_refresh.as_ref()
    }
}

/// Durable location of one source's ledger
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    data_start: ExtractionUnit,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>, data_start: ExtractionUnit) -> Self {
        Self {
            path: path.into(),
            data_start,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger, starting fresh on any problem with the stored file.
    ///
    /// The configured data start always wins over the stored one.
    pub fn load(&self) -> CoverageLedger {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No ledger found, starting fresh");
                return CoverageLedger::new(self.data_start);
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ledger unreadable, starting fresh");
                return CoverageLedger::new(self.data_start);
            },
        };

        let mut ledger: CoverageLedger = match serde_json::from_str(&content) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ledger corrupt, starting fresh");
                return CoverageLedger::new(self.data_start);
            },
        };

        let foreign = ledger
            .extracted_units
            .iter()
            .any(|unit| unit.granularity() != self.data_start.granularity());
        if foreign {
            warn!(
                path = %self.path.display(),
                expected = %self.data_start.granularity(),
                "Ledger holds units of another granularity, starting fresh"
            );
            return CoverageLedger::new(self.data_start);
        }

        if ledger.data_start != self.data_start {
            debug!(stored = %ledger.data_start, configured = %self.data_start, "Data start changed");
            ledger.data_start = self.data_start;
        }

        debug!(
            path = %self.path.display(),
            extracted = ledger.extracted_count(),
            "Loaded ledger"
        );
        ledger
    }

    /// Persist atomically: write a sibling temp file, then rename it over the ledger
    pub fn save(&self, ledger: &CoverageLedger) -> Result<(), LedgerError> {
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let content = serde_json::to_string_pretty(ledger)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".ledger")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(io_err)?;
        tmp.write_all(content.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| LedgerError::Persist {
            path: self.path.display().to_string(),
            source: e,
        })?;

        debug!(path = %self.path.display(), extracted = ledger.extracted_count(), "Saved ledger");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit(s: &str) -> ExtractionUnit {
        s.parse().unwrap()
    }

    fn names(units: &[ExtractionUnit]) -> Vec<String> {
        units.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_missing_units_reports_every_gap_in_order() {
        let mut ledger = CoverageLedger::new(unit("2025-01-01"));
        ledger.mark_extracted(unit("2025-01-01"));
        ledger.mark_extracted(unit("2025-01-03"));

        let missing = ledger.missing_units(unit("2025-01-01"), unit("2025-01-05"));
        assert_eq!(names(&missing), vec!["2025-01-02", "2025-01-04", "2025-01-05"]);
    }

    #[test]
    fn test_forget_drops_unit_and_empty_month() {
        let mut ledger = CoverageLedger::new(unit("2025-05-01"));
        ledger.mark_extracted(unit("2025-05-31"));
        ledger.mark_extracted(unit("2025-06-01"));
        ledger.mark_extracted(unit("2025-06-02"));

        ledger.forget(unit("2025-06-01"));
        assert!(!ledger.is_extracted(unit("2025-06-01")));
        assert!(ledger.extracted_months().contains("202506"));

        ledger.forget(unit("2025-06-02"));
        ledger.forget(unit("2025-06-03"));
        assert_eq!(ledger.extracted_months().iter().collect::<Vec<_>>(), vec!["202505"]);
    }

    #[test]
    fn test_open_period_refresh_tracks_as_of() {
        let mut ledger = CoverageLedger::new(unit("202501"));
        let june = unit("202506");
        let day = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert!(!ledger.open_period_refreshed(june, day("2025-06-05")));

        ledger.record_open_period_refresh(june, day("2025-06-05"));
        assert!(ledger.open_period_refreshed(june, day("2025-06-05")));
        assert!(!ledger.open_period_refreshed(june, day("2025-06-20")));
        assert!(!ledger.open_period_refreshed(unit("202507"), day("2025-06-05")));

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["current_period_refreshed"]["period"], "202506");
        assert_eq!(json["current_period_refreshed"]["as_of"], "2025-06-05");
    }

    #[test]
    fn test_mark_extracted_is_idempotent() {
        let mut ledger = CoverageLedger::new(unit("2025-01-01"));
        ledger.mark_extracted(unit("2025-01-02"));
        ledger.mark_extracted(unit("2025-01-02"));

        assert_eq!(ledger.extracted_count(), 1);
        assert_eq!(ledger.missing_units(unit("2025-01-01"), unit("2025-01-03")).len(), 2);
        assert!(ledger.is_extracted(unit("2025-01-02")));
        assert_eq!(ledger.extracted_months().iter().collect::<Vec<_>>(), vec!["202501"]);
    }

    #[test]
    fn test_mark_extracted_ignores_wrong_granularity() {
        let mut ledger = CoverageLedger::new(unit("202407"));
        ledger.mark_extracted(unit("2024-07-01"));
        ledger.mark_extracted(unit("202408"));

        assert_eq!(names(&ledger.extracted_units().copied().collect::<Vec<_>>()), vec!["202408"]);
    }

    #[test]
    fn test_extracted_between() {
        let mut ledger = CoverageLedger::new(unit("2025-01-01"));
        for day in ["2025-01-01", "2025-01-02", "2025-02-01"] {
            ledger.mark_extracted(unit(day));
        }
        assert_eq!(ledger.extracted_between(unit("2025-01-01"), unit("2025-01-31")), 2);
        assert_eq!(ledger.extracted_between(unit("2025-01-31"), unit("2025-01-01")), 0);
    }

    #[test]
    fn test_record_run_stamps_matching_field() {
        let mut ledger = CoverageLedger::new(unit("2025-01-01"));
        let at = Utc::now();
        ledger.record_run_at(RunKind::Incremental, at);

        assert_eq!(ledger.last_incremental_update(), Some(at));
        assert!(ledger.last_full_extraction().is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join(".ga4_extraction_metadata.json"), unit("2025-03-01"));

        let mut ledger = CoverageLedger::new(unit("2025-03-01"));
        ledger.mark_extracted(unit("2025-03-02"));
        ledger.mark_extracted(unit("2025-03-01"));
        ledger.record_run(RunKind::Full);
        ledger.record_api_calls(4);
        ledger.record_api_error("HTTP 500: boom", "2025-03-03 to 2025-03-04");
        ledger.set_source_identity(BTreeMap::from([("project_id".to_string(), "shop".to_string())]));
        store.save(&ledger).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, ledger);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["extracted_units"], serde_json::json!(["2025-03-01", "2025-03-02"]));
        assert_eq!(raw["data_start_date"], "2025-03-01");
        assert_eq!(raw["extracted_months"], serde_json::json!(["202503"]));
    }

    #[test]
    fn test_corrupt_ledger_loads_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".extraction_metadata.json");
        std::fs::write(&path, "{ not json").unwrap();

        let ledger = LedgerStore::new(&path, unit("202407")).load();
        assert_eq!(ledger.extracted_count(), 0);
        assert_eq!(ledger.data_start(), unit("202407"));
    }

    #[test]
    fn test_missing_ledger_loads_fresh() {
        let dir = TempDir::new().unwrap();
        let ledger = LedgerStore::new(dir.path().join("absent.json"), unit("2025-01-01")).load();
        assert_eq!(ledger, CoverageLedger::new(unit("2025-01-01")));
    }

    #[test]
    fn test_ledger_of_other_granularity_loads_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"extracted_units": ["2025-01-01"], "data_start_date": "2025-01-01"}"#,
        )
        .unwrap();

        let ledger = LedgerStore::new(&path, unit("202407")).load();
        assert_eq!(ledger.extracted_count(), 0);
    }

    #[test]
    fn test_configured_data_start_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"extracted_units": ["2025-01-05"], "data_start_date": "2025-01-01"}"#,
        )
        .unwrap();

        let ledger = LedgerStore::new(&path, unit("2025-01-03")).load();
        assert_eq!(ledger.data_start(), unit("2025-01-03"));
        assert!(ledger.is_extracted(unit("2025-01-05")));
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("nested/ads/ledger.json"), unit("2025-01-01"));
        store.save(&CoverageLedger::new(unit("2025-01-01"))).unwrap();
        assert!(store.path().exists());
    }
}
