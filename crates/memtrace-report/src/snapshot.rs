//! Machine-readable snapshots for automated tests.

use std::io::Write;

use serde::{Deserialize, Serialize};

use memtrace_core::tracker::MemTracker;

use crate::error::Result;

/// One statistics row as exported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotRow {
    pub name: String,
    pub live_count: u64,
    pub live_bytes: u64,
    pub ignored_count: u64,
    pub ignored_bytes: u64,
    pub peak_bytes: u64,
    pub total_allocs: u64,
    pub leaked_bytes: u64,
    pub leaked_count: u64,
}

/// Full statistics snapshot: aggregates first, then subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStatsSnapshot {
    pub slots: Vec<SlotRow>,
    pub live_entries: u64,
    pub distinct_callsites: u64,
}

/// One ownership-handle assignment as exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub handle: u64,
    pub target: u64,
    pub callsite: String,
}

/// Full assignment snapshot, sorted by handle address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub assignments: Vec<AssignmentRow>,
}

/// Capture the statistics tables in one consistent observation.
#[must_use]
pub fn snapshot_live_stats(tracker: &MemTracker) -> LiveStatsSnapshot {
    let slots = tracker
        .stats_snapshot()
        .into_iter()
        .map(|row| SlotRow {
            leaked_bytes: row.leaked_bytes(),
            leaked_count: row.leaked_count(),
            name: row.name,
            live_count: row.live_count,
            live_bytes: row.live_bytes,
            ignored_count: row.ignored_count,
            ignored_bytes: row.ignored_bytes,
            peak_bytes: row.peak_bytes,
            total_allocs: row.total_allocs,
        })
        .collect();
    LiveStatsSnapshot {
        slots,
        live_entries: tracker.live_count() as u64,
        distinct_callsites: tracker.callsite_count() as u64,
    }
}

/// Capture every ownership-handle assignment with a rendered callsite chain.
#[must_use]
pub fn snapshot_assignment_stats(tracker: &MemTracker) -> AssignmentSnapshot {
    let assignments = tracker
        .assignments_snapshot()
        .into_iter()
        .map(|(handle, rec)| AssignmentRow {
            handle: handle as u64,
            target: rec.target as u64,
            callsite: tracker.render_callsite(rec.callsite),
        })
        .collect();
    AssignmentSnapshot { assignments }
}

/// Write the statistics snapshot as pretty JSON.
pub fn write_live_stats_json<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, &snapshot_live_stats(tracker))?;
    writeln!(out)?;
    Ok(())
}

/// Write the assignment snapshot as pretty JSON.
pub fn write_assignment_stats_json<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, &snapshot_assignment_stats(tracker))?;
    writeln!(out)?;
    Ok(())
}
