//! Leak report: outstanding allocations bucketed by callsite.
//!
//! Live entries still outstanding at report time are leaks unless explicitly
//! flagged leak-ignored. Un-ignored entries are bucketed by their interned
//! callsite and sorted by leaked bytes, largest first; the un-ignored bucket
//! count is the pass/fail signal for automated runs. Ignored and
//! pre-initialization totals are reported separately so intentional
//! long-lived allocations stay visible without failing the run.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memtrace_core::callsite::CallsiteId;
use memtrace_core::tracker::MemTracker;

use crate::error::Result;

/// One leak bucket: every outstanding un-ignored allocation from one site.
#[derive(Debug, Clone)]
pub struct LeakBucket {
    pub callsite: CallsiteId,
    pub bytes: u64,
    pub count: u64,
    /// True when every allocation in the bucket predates normal execution.
    pub pre_init_only: bool,
}

/// Collected leak state at one observation point.
#[derive(Debug, Clone, Default)]
pub struct LeakSummary {
    /// Un-ignored buckets, sorted by bytes descending.
    pub buckets: Vec<LeakBucket>,
    pub pre_init_bytes: u64,
    pub pre_init_count: u64,
    pub main_bytes: u64,
    pub main_count: u64,
    pub ignored_bytes: u64,
    pub ignored_count: u64,
}

impl LeakSummary {
    /// The pass/fail leak signal: number of un-ignored buckets.
    #[must_use]
    pub fn leak_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Walk the live table and bucket outstanding allocations by callsite.
#[must_use]
pub fn collect_leaks(tracker: &MemTracker) -> LeakSummary {
    let mut summary = LeakSummary::default();
    let mut buckets: HashMap<u32, LeakBucket> = HashMap::new();

    for (_ptr, entry) in tracker.live_snapshot() {
        if entry.is_ignored() {
            summary.ignored_bytes += entry.size;
            summary.ignored_count += 1;
            continue;
        }
        if entry.is_pre_init() {
            summary.pre_init_bytes += entry.size;
            summary.pre_init_count += 1;
        } else {
            summary.main_bytes += entry.size;
            summary.main_count += 1;
        }
        let bucket = buckets.entry(entry.callsite.0).or_insert(LeakBucket {
            callsite: entry.callsite,
            bytes: 0,
            count: 0,
            pre_init_only: true,
        });
        bucket.bytes += entry.size;
        bucket.count += 1;
        if !entry.is_pre_init() {
            bucket.pre_init_only = false;
        }
    }

    summary.buckets = buckets.into_values().collect();
    // Largest leaks first; tie-break on callsite id for stable output.
    summary
        .buckets
        .sort_unstable_by(|a, b| b.bytes.cmp(&a.bytes).then(a.callsite.0.cmp(&b.callsite.0)));
    summary
}

/// Write a human-readable leak report, returning the un-ignored bucket
/// count. Display is truncated to the tracker's configured cap; the returned
/// count is not.
pub fn report_leaks<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<usize> {
    let summary = collect_leaks(tracker);
    let cap = tracker.config().leak_report_max;

    writeln!(out, "=== leak report ===")?;
    writeln!(
        out,
        "main phase: {} bytes in {} allocations",
        summary.main_bytes, summary.main_count
    )?;
    writeln!(
        out,
        "pre-init:   {} bytes in {} allocations",
        summary.pre_init_bytes, summary.pre_init_count
    )?;
    writeln!(
        out,
        "ignored:    {} bytes in {} allocations",
        summary.ignored_bytes, summary.ignored_count
    )?;
    writeln!(out, "leak buckets: {}", summary.buckets.len())?;

    for bucket in summary.buckets.iter().take(cap) {
        let phase = if bucket.pre_init_only { " [pre-init]" } else { "" };
        writeln!(
            out,
            "  {} bytes in {} allocation(s){} at {}",
            bucket.bytes,
            bucket.count,
            phase,
            tracker.render_callsite(bucket.callsite)
        )?;
    }
    if summary.buckets.len() > cap {
        writeln!(
            out,
            "  ... {} smaller bucket(s) truncated",
            summary.buckets.len() - cap
        )?;
    }

    Ok(summary.leak_count())
}

/// Write every outstanding allocation, oldest first, one line per entry.
pub fn export_allocations<P: AsRef<Path>>(tracker: &MemTracker, path: P) -> Result<()> {
    let file = match File::create(path.as_ref()) {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path = %path.as_ref().display(), %err, "allocation export failed");
            return Err(err.into());
        }
    };
    let mut out = BufWriter::new(file);
    for (ptr, entry) in tracker.live_snapshot() {
        writeln!(
            out,
            "#{} ptr={ptr:#x} size={} flags={:#06b} at {}",
            entry.id,
            entry.size,
            entry.flags,
            tracker.render_callsite(entry.callsite)
        )?;
    }
    out.flush()?;
    Ok(())
}
