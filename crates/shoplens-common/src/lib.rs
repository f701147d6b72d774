//! Shoplens Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the Shoplens workspace.
//!
//! # Overview
//!
//! - **Units**: [`unit::ExtractionUnit`], the day or month that extraction
//!   progress is tracked in
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Errors**: the shared [`CommonError`] and [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use shoplens_common::unit::{ExtractionUnit, Granularity};
//!
//! let unit: ExtractionUnit = "2025-06-01".parse().unwrap();
//! assert_eq!(unit.granularity(), Granularity::Day);
//! assert_eq!(unit.report_month(), "202506");
//! ```

pub mod error;
pub mod logging;
pub mod unit;

pub use error::{CommonError, Result};
pub use unit::{ExtractionUnit, Granularity};
