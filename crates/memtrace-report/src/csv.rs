//! Per-subsystem statistics CSV.
//!
//! Header and column order are a stable contract consumed by downstream
//! tooling; the four aggregate rows (Global, Heap, Pool, Internal) come
//! first, then one row per subsystem in creation order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memtrace_core::tracker::MemTracker;

use crate::error::Result;

pub const CSV_HEADER: &str = "Slot name, Peak allocation (bytes), Total allocation count, \
Live allocation (bytes), Live allocation count, Ignored leaks (bytes), Ignored leak count, \
Memory leaked (bytes), Memory leak count";

/// Write the statistics table as CSV.
pub fn write_statistics_csv<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<()> {
    writeln!(out, "{CSV_HEADER}")?;
    for row in tracker.stats_snapshot() {
        writeln!(
            out,
            "{}, {}, {}, {}, {}, {}, {}, {}, {}",
            row.name,
            row.peak_bytes,
            row.total_allocs,
            row.live_bytes,
            row.live_count,
            row.ignored_bytes,
            row.ignored_count,
            row.leaked_bytes(),
            row.leaked_count()
        )?;
    }
    Ok(())
}

/// Write the statistics CSV to `path`.
pub fn export_statistics_csv<P: AsRef<Path>>(tracker: &MemTracker, path: P) -> Result<()> {
    let file = match File::create(path.as_ref()) {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path = %path.as_ref().display(), %err, "statistics export failed");
            return Err(err.into());
        }
    };
    let mut out = BufWriter::new(file);
    write_statistics_csv(tracker, &mut out)?;
    out.flush()?;
    Ok(())
}
