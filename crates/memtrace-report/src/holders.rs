//! Ownership-handle holder report.
//!
//! Pointer-level leak diagnosis: when a target object is leaked, the handles
//! whose most recent assignment still points at it name the owners keeping
//! it alive.

use std::io::Write;

use memtrace_core::tracker::MemTracker;

use crate::error::Result;

/// Write every handle currently holding `target`, returning the holder
/// count.
pub fn report_holders<W: Write>(tracker: &MemTracker, target: usize, out: &mut W) -> Result<usize> {
    let holders = tracker.holders_of(target);
    writeln!(out, "=== holders of {target:#x} ===")?;
    if holders.is_empty() {
        writeln!(out, "  no tracked handle points at this target")?;
    }
    for (handle, rec) in &holders {
        writeln!(
            out,
            "  handle {handle:#x} assigned at {}",
            tracker.render_callsite(rec.callsite)
        )?;
    }
    Ok(holders.len())
}
