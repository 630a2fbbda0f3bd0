use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attendance figures for one time bucket of a session.
///
/// Scans count half-open, `[window_start, window_end)`; windows are always derived from
/// the event log. Nothing ever writes a window back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Window {
    pub session_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Distinct subjects scanned inside the window.
    pub rfid_count: u32,
    /// Accepted RFID events inside the window, repeats included.
    pub rfid_events: u32,
    /// Latest headcount observed at or before `window_end`, if any.
    pub headcount: Option<u32>,
}
