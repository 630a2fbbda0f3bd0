use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Window;

/// Classified outcome of comparing both signals over one window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub session_id: Uuid,
    pub window: Window,
    pub status: VerdictStatus,
    /// Present only for `Insufficient` verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<InsufficientReason>,
    pub rfid_count: u32,
    pub headcount: Option<u32>,
}

/// - `Green`: both signals present and equal
/// - `Red`: both signals present and different
/// - `Insufficient`: not enough data to judge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Green,
    Red,
    Insufficient,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Red => "red",
            Self::Insufficient => "insufficient",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsufficientReason {
    NoScans,
    NoHeadcount,
    BelowThreshold { observed: u32, required: u32 },
}

impl InsufficientReason {
    pub fn message(&self) -> String {
        match self {
            Self::NoScans => "No RFID scans recorded for this class yet.".to_string(),
            Self::NoHeadcount => "No headcount recorded for this class yet.".to_string(),
            Self::BelowThreshold { observed, required } => format!(
                "Not enough RFID scans to verify ({} of {} required).",
                observed, required
            ),
        }
    }
}

/// Dashboard-facing view of a verdict.
///
/// `status` is `"green"`, `"red"`, or a human-readable explanation when the
/// verdict is insufficient. `verdict` always carries the machine-readable status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyResponse {
    pub class_id: String,
    pub session_id: Uuid,
    pub status: String,
    pub verdict: VerdictStatus,
    pub rfid_count: u32,
    pub headcount: Option<u32>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl VerifyResponse {
    pub fn new(class_id: impl Into<String>, verdict: &Verdict) -> Self {
        let status = match (verdict.status, verdict.reason) {
            (VerdictStatus::Insufficient, Some(reason)) => reason.message(),
            (status, _) => status.as_str().to_string(),
        };

        Self {
            class_id: class_id.into(),
            session_id: verdict.session_id,
            status,
            verdict: verdict.status,
            rfid_count: verdict.rfid_count,
            headcount: verdict.headcount,
            window_start: verdict.window.window_start,
            window_end: verdict.window.window_end,
        }
    }
}
