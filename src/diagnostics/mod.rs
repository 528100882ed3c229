//! Diagnostics data model returned alongside the trained tensors.
//!
//! `FitReport` is the main entry point: it carries the run shape, the
//! per-iteration timings and the optional π change trace.

pub mod report;
pub mod timing;

pub use report::FitReport;
pub use timing::{Stage, StageTiming, TimingBreakdown};
