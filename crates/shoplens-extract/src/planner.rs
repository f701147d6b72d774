//! Extraction planning
//!
//! Turns a mode, the ledger, and an as-of date into the ordered list of
//! units a run has to fetch. Candidate units are computed from the ledger
//! alone and then filtered through the adapter's availability probe.
//!
//! The open month is written with force-overwrite, so a plan that touches it
//! must cover all of it: any incremental plan reaching into the open month is
//! widened to the whole month-to-date. `smart` also revisits the open month
//! when it has not been rewritten through the current as-of date yet.

use crate::error::{ExtractError, SourceError};
use crate::ledger::CoverageLedger;
use crate::source::SourceAdapter;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use shoplens_common::unit::ExtractionUnit;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// What a run re-fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Everything from the data start, regardless of the ledger
    Full,
    /// Only units the ledger does not have yet
    #[default]
    Smart,
    /// The open month to date, always re-fetched
    CurrentPeriod,
    /// The trailing N units, regardless of the ledger
    LastN,
    /// The single latest reportable unit
    Yesterday,
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionMode::Full => "full",
            ExtractionMode::Smart => "smart",
            ExtractionMode::CurrentPeriod => "current_period",
            ExtractionMode::LastN => "last_n",
            ExtractionMode::Yesterday => "yesterday",
        };
        f.write_str(name)
    }
}

/// Units to fetch for `mode`, oldest first.
///
/// `last_n` overrides the profile's trailing window length. Probe failures
/// on authentication abort planning as a setup error; any other probe
/// failure skips that unit for this run.
pub async fn plan(
    adapter: &dyn SourceAdapter,
    ledger: &CoverageLedger,
    mode: ExtractionMode,
    as_of: NaiveDate,
    last_n: Option<u32>,
) -> Result<Vec<ExtractionUnit>, ExtractError> {
    let candidates = candidates(adapter, ledger, mode, as_of, last_n);
    let candidates = with_open_period(adapter, ledger, mode, as_of, candidates);
    debug!(%mode, candidates = candidates.len(), "Planning extraction");

    let mut units = Vec::with_capacity(candidates.len());
    for unit in candidates {
        match adapter.is_available(unit, as_of).await {
            Ok(true) => units.push(unit),
            Ok(false) => debug!(%unit, "Unit not available upstream yet"),
            Err(e) if is_auth_failure(&e) => {
                return Err(ExtractError::setup(format!("Cannot reach source: {}", e)));
            },
            Err(e) => warn!(%unit, error = %e, "Availability probe failed, skipping unit"),
        }
    }

    info!(%mode, units = units.len(), "Planned extraction");
    Ok(units)
}

/// Units a mode considers before the availability probe
pub fn candidates(
    adapter: &dyn SourceAdapter,
    ledger: &CoverageLedger,
    mode: ExtractionMode,
    as_of: NaiveDate,
    last_n: Option<u32>,
) -> Vec<ExtractionUnit> {
    let profile = adapter.profile();
    let start = ledger.data_start();
    let latest = profile.latest_unit(as_of);

    let range_from = |first: ExtractionUnit| -> Vec<ExtractionUnit> {
        ExtractionUnit::range_inclusive(first.max(start), latest).collect()
    };

    match mode {
        ExtractionMode::Full => range_from(start),
        ExtractionMode::Smart => ledger.missing_units(start, latest),
        ExtractionMode::CurrentPeriod => open_period_units(adapter, ledger, as_of),
        ExtractionMode::LastN => {
            let n = last_n.unwrap_or(profile.default_last_n).max(1);
            let first = latest.back(n - 1).unwrap_or(start);
            range_from(first)
        },
        ExtractionMode::Yesterday => {
            if latest >= start {
                vec![latest]
            } else {
                Vec::new()
            }
        },
    }
}

/// Units of the open month between the data start and the latest unit
pub fn open_period_units(
    adapter: &dyn SourceAdapter,
    ledger: &CoverageLedger,
    as_of: NaiveDate,
) -> Vec<ExtractionUnit> {
    let profile = adapter.profile();
    let open = profile.open_period(as_of);
    let first = ExtractionUnit::containing(profile.granularity, open.first_day()).max(ledger.data_start());
    ExtractionUnit::range_inclusive(first, profile.latest_unit(as_of)).collect()
}

/// Widen `units` to the whole open month when the run will rewrite it
fn with_open_period(
    adapter: &dyn SourceAdapter,
    ledger: &CoverageLedger,
    mode: ExtractionMode,
    as_of: NaiveDate,
    units: Vec<ExtractionUnit>,
) -> Vec<ExtractionUnit> {
    if mode == ExtractionMode::Full {
        return units;
    }
    let open_units = open_period_units(adapter, ledger, as_of);
    if open_units.is_empty() {
        return units;
    }

    let open = adapter.profile().open_period(as_of);
    let touches_open = units.iter().any(|unit| open.contains(unit.first_day()));
    let stale_open = mode == ExtractionMode::Smart && !ledger.open_period_refreshed(open, as_of);
    if !touches_open && !stale_open {
        return units;
    }

    debug!(period = %open, "Including the whole open period");
    let widened: BTreeSet<ExtractionUnit> = units.into_iter().chain(open_units).collect();
    widened.into_iter().collect()
}

fn is_auth_failure(error: &SourceError) -> bool {
    match error {
        SourceError::Auth(_) => true,
        SourceError::Status { status, .. } => *status == 401 || *status == 403,
        _ => false,
    }
}
