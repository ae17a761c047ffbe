//! # memtrace-report
//!
//! Reporting over a [`memtrace_core::tracker::MemTracker`]: human-readable
//! leak reports, per-subsystem statistics CSV, a callgrind-compatible
//! call-graph export, JSON snapshots for automated tests, and
//! ownership-handle holder listings. Reports read consistent snapshots taken
//! under the tracker's mutex and never mutate tracking state.

#![forbid(unsafe_code)]

pub mod callgrind;
pub mod csv;
pub mod error;
pub mod holders;
pub mod hottest;
pub mod leaks;
pub mod snapshot;

pub use callgrind::{export_call_graph, write_callgrind};
pub use csv::{CSV_HEADER, export_statistics_csv, write_statistics_csv};
pub use error::{ReportError, Result};
pub use holders::report_holders;
pub use hottest::{HotSite, collect_hottest, report_hottest};
pub use leaks::{LeakBucket, LeakSummary, collect_leaks, export_allocations, report_leaks};
pub use snapshot::{
    AssignmentSnapshot, LiveStatsSnapshot, snapshot_assignment_stats, snapshot_live_stats,
    write_assignment_stats_json, write_live_stats_json,
};
