//! Extraction driver
//!
//! One run goes plan, batch, then fetch, write and mark for each batch,
//! and finally stamp and save the ledger. Batches run strictly one after
//! another. A batch whose fetch or write fails is recorded in the summary
//! and its units stay missing, so the next `smart` run picks them up again.

use crate::config::ExtractConfig;
use crate::error::{ExtractError, Result};
use crate::ledger::{CoverageLedger, LedgerStore, RunKind};
use crate::planner::{self, ExtractionMode};
use crate::source::{self, FetchWindow, Row, SourceAdapter, SourceKind, SourceProfile};
use crate::writer::PartitionedWriter;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shoplens_common::unit::ExtractionUnit;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing needed fetching
    UpToDate,
    /// Every batch succeeded
    Success,
    /// Some batches failed
    Partial,
    /// Every batch failed
    Failed,
}

/// Result of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub first: ExtractionUnit,
    pub last: ExtractionUnit,
    pub units: usize,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a run did, returned to the caller and printed by the CLI
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRunSummary {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub mode: ExtractionMode,
    pub status: RunStatus,
    pub as_of: NaiveDate,
    /// Units fetched successfully in this run
    #[serde(rename = "dates_processed")]
    pub units_processed: usize,
    pub total_rows: usize,
    /// Partitions that received new data
    pub months_updated: BTreeSet<String>,
    pub errors: Vec<String>,
    pub api_calls_made: u64,
    pub batches: Vec<BatchOutcome>,
}

impl ExtractionRunSummary {
    fn new(source: SourceKind, mode: ExtractionMode, as_of: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            mode,
            status: RunStatus::UpToDate,
            as_of,
            units_processed: 0,
            total_rows: 0,
            months_updated: BTreeSet::new(),
            errors: Vec::new(),
            api_calls_made: 0,
            batches: Vec::new(),
        }
    }

    fn settle_status(&mut self) {
        self.status = if self.batches.is_empty() {
            RunStatus::UpToDate
        } else if self.errors.is_empty() {
            RunStatus::Success
        } else if self.units_processed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
    }
}

/// Knobs of a single run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: ExtractionMode,
    /// Defaults to yesterday
    pub end_date: Option<NaiveDate>,
    /// Defaults to the source profile's batch size
    pub batch_size: Option<usize>,
    /// Window length for `last_n`
    pub last_n: Option<u32>,
    /// Requested dimensions; empty means the source's defaults
    pub dimensions: Vec<String>,
}

impl RunOptions {
    pub fn new(mode: ExtractionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Last complete day
pub fn default_as_of() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

/// First touch of a partition within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionTouch {
    Written,
    Skipped,
}

/// Per-run bookkeeping shared across batches
struct RunState {
    /// Partition key of the open month, written with force-overwrite
    current_period: String,
    partitions: HashMap<String, PartitionTouch>,
    /// Units of batches that fetched and wrote cleanly
    succeeded: BTreeSet<ExtractionUnit>,
}

/// Orchestrates planner, adapter, writer and ledger for one source
pub struct ExtractionDriver {
    adapter: Arc<dyn SourceAdapter>,
    store: LedgerStore,
    writer: PartitionedWriter,
}

impl ExtractionDriver {
    pub fn new(adapter: Arc<dyn SourceAdapter>, store: LedgerStore, writer: PartitionedWriter) -> Self {
        Self {
            adapter,
            store,
            writer,
        }
    }

    /// Driver for `kind` with the ledger and table inside the source's output path
    pub fn from_config(kind: SourceKind, config: &ExtractConfig) -> Result<Self> {
        let adapter = source::build_source(kind, config)?;
        Ok(Self::for_adapter(adapter, config.output_path(kind), config.data_start(kind)))
    }

    /// Standard layout: `<output>/<ledger file>` and `<output>/<table>/...`
    pub fn for_adapter(
        adapter: Arc<dyn SourceAdapter>,
        output_path: impl Into<std::path::PathBuf>,
        data_start: ExtractionUnit,
    ) -> Self {
        let output_path = output_path.into();
        let store = LedgerStore::new(output_path.join(adapter.profile().ledger_file), data_start);
        let writer = PartitionedWriter::new(output_path);
        Self::new(adapter, store, writer)
    }

    pub fn ledger_store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn writer(&self) -> &PartitionedWriter {
        &self.writer
    }

    pub fn profile(&self) -> &SourceProfile {
        self.adapter.profile()
    }

    /// Run `mode` up to `end_date` in batches of `batch_size` units
    pub async fn run(
        &self,
        mode: ExtractionMode,
        batch_size: Option<usize>,
        end_date: Option<NaiveDate>,
    ) -> Result<ExtractionRunSummary> {
        let options = RunOptions {
            mode,
            end_date,
            batch_size,
            ..RunOptions::default()
        };
        self.run_with(&options).await
    }

    /// Run with every knob available.
    ///
    /// Returns an error only for setup failures and when the ledger cannot be
    /// saved. Batch failures are reported in the summary.
    pub async fn run_with(&self, options: &RunOptions) -> Result<ExtractionRunSummary> {
        let profile = self.adapter.profile();
        let as_of = options.end_date.unwrap_or_else(default_as_of);
        let summary = ExtractionRunSummary::new(profile.kind, options.mode, as_of);

        let span = info_span!(
            "extraction_run",
            run_id = %summary.run_id,
            source = %profile.kind,
            mode = %options.mode
        );
        self.execute(options, summary).instrument(span).await
    }

    async fn execute(
        &self,
        options: &RunOptions,
        mut summary: ExtractionRunSummary,
    ) -> Result<ExtractionRunSummary> {
        let profile = self.adapter.profile();
        let as_of = summary.as_of;
        let batch_size = options.batch_size.unwrap_or(profile.default_batch_size).max(1);
        let calls_before = self.adapter.api_calls();

        info!("Starting {} extraction as of {}", options.mode, as_of);

        let mut ledger = self.store.load();
        ledger.set_source_identity(self.adapter.identity());

        let units = planner::plan(self.adapter.as_ref(), &ledger, options.mode, as_of, options.last_n).await?;
        if units.is_empty() {
            info!("All data is up to date");
            summary.api_calls_made = self.adapter.api_calls().saturating_sub(calls_before);
            summary.settle_status();
            return Ok(summary);
        }

        let batches = contiguous_batches(&units, batch_size);
        info!(
            "Extracting {} {}s in {} batches",
            units.len(),
            profile.granularity,
            batches.len()
        );

        let open_period = profile.open_period(as_of);
        let mut state = RunState {
            current_period: open_period.report_month(),
            partitions: HashMap::new(),
            succeeded: BTreeSet::new(),
        };

        for (index, batch) in batches.iter().enumerate() {
            let (Some(&first), Some(&last)) = (batch.first(), batch.last()) else {
                continue;
            };
            let window = FetchWindow::new(first, last, as_of);
            info!("Processing batch {}/{}: {}", index + 1, batches.len(), window);

            if !profile.request_delay.is_zero() {
                tokio::time::sleep(profile.request_delay).await;
            }

            let outcome = match self.process_batch(&window, options, &mut state, &mut summary).await {
                Ok(rows) => {
                    for unit in batch {
                        ledger.mark_extracted(*unit);
                        state.succeeded.insert(*unit);
                    }
                    summary.units_processed += batch.len();
                    summary.total_rows += rows;
                    info!("Batch {} complete: {} rows", window, rows);
                    BatchOutcome {
                        first,
                        last,
                        units: batch.len(),
                        rows,
                        error: None,
                    }
                },
                Err(e) => {
                    let message = format!("Error processing batch {}: {}", window, e);
                    error!("{}", message);
                    if matches!(e, ExtractError::SourceFetch(_)) {
                        ledger.record_api_error(e.to_string(), window.to_string());
                    }
                    summary.errors.push(message.clone());
                    BatchOutcome {
                        first,
                        last,
                        units: batch.len(),
                        rows: 0,
                        error: Some(message),
                    }
                },
            };
            summary.batches.push(outcome);

            if index + 1 < batches.len() && !profile.batch_delay.is_zero() {
                tokio::time::sleep(profile.batch_delay).await;
            }
        }

        summary.api_calls_made = self.adapter.api_calls().saturating_sub(calls_before);
        summary.settle_status();

        settle_open_period(&mut ledger, open_period, as_of, &units, &state);
        self.finish_ledger(&mut ledger, options.mode, summary.api_calls_made);
        self.store.save(&ledger)?;

        info!(
            status = ?summary.status,
            "Extraction complete: {} units, {} rows, {} partitions updated, {} errors",
            summary.units_processed,
            summary.total_rows,
            summary.months_updated.len(),
            summary.errors.len()
        );

        Ok(summary)
    }

    /// Fetch and write one batch, returning the row count
    async fn process_batch(
        &self,
        window: &FetchWindow,
        options: &RunOptions,
        state: &mut RunState,
        summary: &mut ExtractionRunSummary,
    ) -> Result<usize> {
        let rows = self.adapter.fetch(window, &options.dimensions).await?;
        if rows.is_empty() {
            info!("No rows for {}", window);
            return Ok(0);
        }

        let row_count = rows.len();
        let table = self.adapter.profile().table_name;

        for (period, group) in group_by_partition(rows) {
            match state.partitions.get(&period) {
                Some(PartitionTouch::Written) => {
                    self.writer.append(&group, table, &period)?;
                    summary.months_updated.insert(period);
                },
                Some(PartitionTouch::Skipped) => {
                    info!(partition = %period, "Partition was kept earlier in this run, skipping");
                },
                None => {
                    let force = period == state.current_period;
                    let wrote = self.writer.write(&group, table, &period, force)?;
                    let touch = if wrote {
                        summary.months_updated.insert(period.clone());
                        PartitionTouch::Written
                    } else {
                        PartitionTouch::Skipped
                    };
                    state.partitions.insert(period, touch);
                },
            }
        }

        Ok(row_count)
    }

    fn finish_ledger(&self, ledger: &mut CoverageLedger, mode: ExtractionMode, api_calls: u64) {
        ledger.record_api_calls(api_calls);
        let kind = if mode == ExtractionMode::Full {
            RunKind::Full
        } else {
            RunKind::Incremental
        };
        ledger.record_run(kind);
    }
}

/// Reconcile the ledger with the open month after its partition was handled.
///
/// Once this run rewrote the open partition, only units this run fetched are
/// backed by rows, so earlier marks in that month are dropped. The month
/// counts as refreshed through `as_of` when every planned unit of it
/// succeeded.
fn settle_open_period(
    ledger: &mut CoverageLedger,
    open_period: ExtractionUnit,
    as_of: NaiveDate,
    units: &[ExtractionUnit],
    state: &RunState,
) {
    let in_open = |unit: &ExtractionUnit| open_period.contains(unit.first_day());
    if !units.iter().any(in_open) {
        return;
    }

    if state.partitions.get(&state.current_period) == Some(&PartitionTouch::Written) {
        let dropped: Vec<ExtractionUnit> = ledger
            .extracted_units()
            .filter(|unit| in_open(unit) && !state.succeeded.contains(*unit))
            .copied()
            .collect();
        for unit in dropped {
            warn!(%unit, "Open period was rewritten without this unit, marking it missing");
            ledger.forget(unit);
        }
    }

    if units.iter().filter(|unit| in_open(unit)).all(|unit| state.succeeded.contains(unit)) {
        ledger.record_open_period_refresh(open_period, as_of);
    }
}

/// Split ascending units into runs of consecutive units, at most `batch_size` long
pub fn contiguous_batches(units: &[ExtractionUnit], batch_size: usize) -> Vec<Vec<ExtractionUnit>> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Vec<ExtractionUnit>> = Vec::new();

    for &unit in units {
        let extends_last = batches.last().is_some_and(|batch| {
            batch.len() < batch_size && batch.last().and_then(|prev| prev.next()) == Some(unit)
        });
        match batches.last_mut() {
            Some(batch) if extends_last => batch.push(unit),
            _ => batches.push(vec![unit]),
        }
    }

    batches
}

fn group_by_partition(rows: Vec<Row>) -> BTreeMap<String, Vec<Row>> {
    let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.report_month()).or_default().push(row);
    }
    groups
}
