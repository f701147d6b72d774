//! Shared helpers for driver integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use shoplens_common::unit::ExtractionUnit;
use shoplens_extract::error::SourceError;
use shoplens_extract::source::{FetchWindow, Row, SourceAdapter, SourceKind, SourceProfile};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory source with scripted availability and failures
pub struct ScriptedSource {
    profile: SourceProfile,
    /// Units reported as unavailable upstream
    pub unavailable: BTreeSet<ExtractionUnit>,
    /// Units returning no rows
    pub empty: BTreeSet<ExtractionUnit>,
    /// Windows (by first unit) whose fetch fails
    failing: Mutex<BTreeSet<ExtractionUnit>>,
    /// Label written into each row
    tag: Mutex<String>,
    fetched: Mutex<Vec<(ExtractionUnit, ExtractionUnit)>>,
    calls: AtomicU64,
}

impl ScriptedSource {
    /// Source for `kind` with all pacing delays removed
    pub fn new(kind: SourceKind) -> Self {
        let mut profile = SourceProfile::for_kind(kind);
        profile.batch_delay = Duration::ZERO;
        profile.request_delay = Duration::ZERO;
        Self {
            profile,
            unavailable: BTreeSet::new(),
            empty: BTreeSet::new(),
            failing: Mutex::new(BTreeSet::new()),
            tag: Mutex::new("first".to_string()),
            fetched: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn fail_window_starting_at(&self, unit: &str) {
        self.failing.lock().unwrap().insert(unit.parse().unwrap());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_tag(&self, tag: &str) {
        *self.tag.lock().unwrap() = tag.to_string();
    }

    /// Windows fetched so far as `(first, last)` strings
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("project_id".to_string(), "test-project".to_string())])
    }

    async fn is_available(&self, unit: ExtractionUnit, _as_of: NaiveDate) -> Result<bool, SourceError> {
        Ok(!self.unavailable.contains(&unit))
    }

    async fn fetch(&self, window: &FetchWindow, _dimensions: &[String]) -> Result<Vec<Row>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push((window.first, window.last));

        if self.failing.lock().unwrap().contains(&window.first) {
            return Err(SourceError::Status {
                status: 500,
                body: "backend error".to_string(),
            });
        }

        let tag = self.tag.lock().unwrap().clone();
        let rows = window
            .units()
            .filter(|unit| !self.empty.contains(unit))
            .map(|unit| {
                let fields = json!({"unit": unit.to_string(), "tag": tag});
                Row::new(unit, fields.as_object().unwrap().clone())
            })
            .collect();
        Ok(rows)
    }

    fn api_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn unit(s: &str) -> ExtractionUnit {
    s.parse().unwrap()
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}
