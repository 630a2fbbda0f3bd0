use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable attendance observation.
///
/// RFID events carry a `subject_id` and no `count`; headcount events carry a
/// `count` and no `subject_id`. Events are ordered by `timestamp`, with `seq`
/// (the store's insertion sequence) breaking ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub seq: i64,
    pub session_id: Uuid,
    pub source: EventSource,
    pub subject_id: Option<String>,
    pub count: Option<u32>,
    /// Key used to collapse repeat submissions of the same observation.
    pub dedup_key: Option<String>,
    /// When the observation happened.
    pub timestamp: DateTime<Utc>,
    pub recorded_by: String,
    /// When the store accepted the event.
    pub recorded_at: DateTime<Utc>,
}

/// Which signal an event belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Rfid,
    Headcount,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rfid => "rfid",
            Self::Headcount => "headcount",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rfid" => Some(Self::Rfid),
            "headcount" => Some(Self::Headcount),
            _ => None,
        }
    }
}

/// Input for appending an event to a session.
///
/// `count` is signed so that a negative value reaches validation and is
/// rejected as an invalid event instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    pub source: EventSource,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
    /// Defaults to `subject_id` for RFID events. Headcounts are only
    /// deduplicated when a key is given explicitly.
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Defaults to the time of the append.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventInput {
    pub fn rfid(subject_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            source: EventSource::Rfid,
            subject_id: Some(subject_id.into()),
            count: None,
            dedup_key: None,
            timestamp: Some(timestamp),
        }
    }

    pub fn headcount(count: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            source: EventSource::Headcount,
            subject_id: None,
            count: Some(count),
            dedup_key: None,
            timestamp: Some(timestamp),
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// The key this event is deduplicated under, if any.
    pub fn effective_dedup_key(&self) -> Option<String> {
        match (&self.dedup_key, self.source) {
            (Some(key), _) => Some(key.clone()),
            (None, EventSource::Rfid) => self.subject_id.as_deref().map(|s| s.trim().to_string()),
            (None, EventSource::Headcount) => None,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    /// The event was stored.
    Recorded { event: AttendanceEvent },
    /// A matching event was already stored within the dedup tolerance; nothing
    /// was written.
    Deduplicated { existing: AttendanceEvent },
}

impl AppendOutcome {
    /// The stored event: the new one, or the one this submission collapsed into.
    pub fn event(&self) -> &AttendanceEvent {
        match self {
            Self::Recorded { event } => event,
            Self::Deduplicated { existing } => existing,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Deduplicated { .. })
    }
}

/// Body of a batch ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEventsInput {
    pub events: Vec<EventInput>,
}

/// Per-event outcome of a batch ingest. One rejected event never affects the
/// others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEventResult {
    /// Position of the event in the submitted batch.
    pub index: usize,
    pub outcome: BatchOutcome,
    #[serde(default)]
    pub event: Option<AttendanceEvent>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Recorded,
    Deduplicated,
    Rejected,
}

/// Body of a batch ingest response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEventsResponse {
    pub results: Vec<BatchEventResult>,
}

/// A tag scan submitted by a reader, resolved through the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordScanInput {
    pub rfid_tag: String,
    pub class_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A headcount observation for a class's open session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeadcountInput {
    pub class_id: String,
    pub count: i64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One point of a class's headcount series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadcountPoint {
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

/// A stored RFID scan with the class it was recorded for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub class_id: String,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanList {
    pub scans: Vec<ScanRecord>,
}

/// A stored headcount with the class it was recorded for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadcountRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub class_id: String,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadcountList {
    pub headcounts: Vec<HeadcountRecord>,
}

/// Optional time bounds. `from` is inclusive, `to` is exclusive.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }

    /// Whether the half-open span `[start, end)` intersects this range.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| end > from) && self.to.map_or(true, |to| start < to)
    }
}
