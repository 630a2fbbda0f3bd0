//! Classification of windows into verdicts.

use serde::{Deserialize, Serialize};

use crate::models::*;

/// Tuning for [`Reconciler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Distinct RFID subjects a window needs before its count is trusted.
    /// Below this the verdict is `Insufficient`, even when the numbers agree.
    pub min_rfid_events: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { min_rfid_events: 1 }
    }
}

/// Compares the RFID and headcount signals of a window. Pure and synchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.config
    }

    pub fn classify(&self, window: &Window) -> Verdict {
        let reason = if window.rfid_count == 0 {
            Some(InsufficientReason::NoScans)
        } else if window.headcount.is_none() {
            Some(InsufficientReason::NoHeadcount)
        } else if window.rfid_count < self.config.min_rfid_events {
            Some(InsufficientReason::BelowThreshold {
                observed: window.rfid_count,
                required: self.config.min_rfid_events,
            })
        } else {
            None
        };

        let status = match (reason, window.headcount) {
            (Some(_), _) => VerdictStatus::Insufficient,
            (None, Some(headcount)) if headcount == window.rfid_count => VerdictStatus::Green,
            (None, _) => VerdictStatus::Red,
        };

        Verdict {
            session_id: window.session_id,
            window: window.clone(),
            status,
            reason,
            rfid_count: window.rfid_count,
            headcount: window.headcount,
        }
    }
}
