//! Shoplens incremental extraction
//!
//! Pulls marketing data from GA4 (BigQuery export), Google Ads and Search
//! Console into month-partitioned JSON Lines tables, and remembers per
//! source which days or months have already been pulled so that re-runs
//! only fetch what is missing.
//!
//! # Overview
//!
//! - **Ledger**: durable per-source coverage record ([`ledger`])
//! - **Planner**: which units a mode has to fetch ([`planner`])
//! - **Sources**: one adapter per API behind [`source::SourceAdapter`]
//! - **Writer**: skip-or-replace partition writes ([`writer`])
//! - **Driver**: batches, error isolation and the run summary ([`driver`])
//! - **Status**: coverage report and recommendations ([`status`])

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod planner;
pub mod source;
pub mod status;
pub mod writer;

pub use config::ExtractConfig;
pub use driver::{ExtractionDriver, ExtractionRunSummary, RunOptions, RunStatus};
pub use error::{ExtractError, Result};
pub use ledger::{CoverageLedger, LedgerStore};
pub use planner::ExtractionMode;
pub use source::{SourceAdapter, SourceKind};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Shoplens marketing data extractor
#[derive(Parser, Debug)]
#[command(name = "shoplens-extract")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source to operate on
    #[arg(value_enum)]
    pub source: SourceKind,

    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract data and update the coverage ledger
    Run {
        /// Which units to fetch
        #[arg(long, value_enum, default_value_t = ExtractionMode::Smart)]
        mode: ExtractionMode,

        /// Last complete day to consider (YYYY-MM-DD, defaults to yesterday)
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Units per API call
        #[arg(long)]
        batch_size: Option<usize>,

        /// Window length for `--mode last_n`
        #[arg(long)]
        last_n: Option<u32>,

        /// Only this Google Ads campaign
        #[arg(long)]
        campaign_id: Option<String>,

        /// Only this Google Ads ad group
        #[arg(long)]
        ad_group_id: Option<String>,

        /// Search Console dimensions (comma separated)
        #[arg(long, value_delimiter = ',')]
        dimensions: Vec<String>,
    },

    /// Show extraction coverage and recommendations
    Status {
        /// Last complete day to report against (YYYY-MM-DD, defaults to yesterday)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}
