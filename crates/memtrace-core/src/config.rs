//! Tracker configuration.
//!
//! A tracker is constructed explicitly from a [`TrackerConfig`] rather than
//! read from ambient global state; `from_env` overlays a few environment
//! knobs onto the defaults for harness and test runs.

use crate::callsite::CaptureMode;
use crate::pool::PoolConfig;

/// Arena page size for callsite record storage.
pub const DEFAULT_ARENA_PAGE_BYTES: usize = 64 * 1024;

/// Shadow frames recorded per capture.
pub const DEFAULT_SHADOW_DEPTH: usize = 16;

/// Construction-time configuration for a tracker context.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub capture_mode: CaptureMode,
    /// Shadow frames recorded per capture, leaf first.
    pub shadow_depth: usize,
    /// Leading native frames to skip; covers the tracker's own entry frames.
    pub native_skip: usize,
    /// Native walk depth under [`CaptureMode::FastNative`].
    pub fast_native_depth: usize,
    /// Native walk depth under [`CaptureMode::FullNative`].
    pub full_native_depth: usize,
    pub pool: PoolConfig,
    pub arena_page_bytes: usize,
    /// Leak report bucket display cap; larger runs truncate to the worst N.
    pub leak_report_max: usize,
    /// Hottest-callsites report cap.
    pub hottest_max: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_mode: CaptureMode::ShadowOnly,
            shadow_depth: DEFAULT_SHADOW_DEPTH,
            native_skip: 2,
            fast_native_depth: 16,
            full_native_depth: 64,
            pool: PoolConfig::default(),
            arena_page_bytes: DEFAULT_ARENA_PAGE_BYTES,
            leak_report_max: 64,
            hottest_max: 32,
        }
    }
}

impl TrackerConfig {
    /// Defaults overlaid with `MEMTRACE_CAPTURE` and `MEMTRACE_LEAK_MAX`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("MEMTRACE_CAPTURE") {
            cfg.capture_mode = parse_capture_mode(&raw);
        }
        if let Ok(raw) = std::env::var("MEMTRACE_LEAK_MAX")
            && let Ok(n) = raw.parse::<usize>()
        {
            cfg.leak_report_max = n.max(1);
        }
        cfg
    }

    /// Validate the capture knobs. Pool structure is checked separately when
    /// the bookkeeping allocator is constructed.
    pub fn validate(&self) -> Result<(), String> {
        if self.shadow_depth == 0 {
            return Err("shadow_depth must be at least 1".to_string());
        }
        if self.arena_page_bytes < 256 {
            return Err("arena_page_bytes too small to hold a record".to_string());
        }
        Ok(())
    }
}

fn parse_capture_mode(raw: &str) -> CaptureMode {
    match raw.to_ascii_lowercase().as_str() {
        "fast" | "fast-native" => CaptureMode::FastNative,
        "full" | "full-native" | "complete" => CaptureMode::FullNative,
        // Shadow-only is the safe default for unknown values.
        _ => CaptureMode::ShadowOnly,
    }
}
