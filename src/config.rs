//! Tuning knobs for the verification core.
//!
//! The server binary fills this from CLI flags (each with an environment
//! fallback); tests usually start from [`ServiceConfig::default`].

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::aggregate::DEFAULT_WINDOW_SECS;
use crate::db::DEFAULT_DEDUP_TOLERANCE_SECS;
use crate::reconcile::ReconcilerConfig;

/// How long a computed verdict is served before it is recomputed, unless an
/// append invalidates it first. Matches the dashboard's polling interval.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Width of each aggregation window.
    pub window_size: Duration,
    /// Maximum distance between two events with the same dedup key for the
    /// second to be dropped.
    pub dedup_tolerance: Duration,
    pub reconciler: ReconcilerConfig,
    pub cache_ttl: StdDuration,
}

impl ServiceConfig {
    pub fn with_window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_min_rfid_events(mut self, min_rfid_events: u32) -> Self {
        self.reconciler.min_rfid_events = min_rfid_events;
        self
    }

    pub fn with_dedup_tolerance(mut self, tolerance: Duration) -> Self {
        self.dedup_tolerance = tolerance;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: StdDuration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::seconds(DEFAULT_WINDOW_SECS),
            dedup_tolerance: Duration::seconds(DEFAULT_DEDUP_TOLERANCE_SECS),
            reconciler: ReconcilerConfig::default(),
            cache_ttl: StdDuration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}
