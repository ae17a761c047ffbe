//! Hottest callsites by allocation count.

use std::io::Write;

use memtrace_core::callsite::CallsiteId;
use memtrace_core::tracker::MemTracker;

use crate::error::Result;

/// One row of the hottest-callsites listing.
#[derive(Debug, Clone)]
pub struct HotSite {
    pub callsite: CallsiteId,
    pub alloc_count: u64,
    pub first_seen_ms: u64,
}

/// The busiest callsites, ordered by allocation count descending and capped
/// at the tracker's configured table size. Reaching the cap is expected on
/// large runs; a notice is logged and the rest are dropped.
#[must_use]
pub fn collect_hottest(tracker: &MemTracker) -> Vec<HotSite> {
    let cap = tracker.config().hottest_max;
    let mut sites: Vec<HotSite> = (0..tracker.callsite_count() as u32)
        .map(|raw| {
            let id = CallsiteId(raw);
            let stats = tracker.callsite_stats(id);
            HotSite {
                callsite: id,
                alloc_count: stats.alloc_count,
                first_seen_ms: stats.first_seen_ms,
            }
        })
        .collect();

    sites.sort_unstable_by(|a, b| {
        b.alloc_count
            .cmp(&a.alloc_count)
            .then(a.callsite.0.cmp(&b.callsite.0))
    });
    if sites.len() > cap {
        tracing::info!(
            dropped = sites.len() - cap,
            cap,
            "hottest-callsites table full"
        );
        sites.truncate(cap);
    }
    sites
}

/// Write the hottest-callsites listing.
pub fn report_hottest<W: Write>(tracker: &MemTracker, out: &mut W) -> Result<()> {
    let sites = collect_hottest(tracker);
    writeln!(out, "=== hottest callsites ===")?;
    for site in &sites {
        writeln!(
            out,
            "  {} allocation(s) (first seen {}ms) at {}",
            site.alloc_count,
            site.first_seen_ms,
            tracker.render_callsite(site.callsite)
        )?;
    }
    Ok(())
}
