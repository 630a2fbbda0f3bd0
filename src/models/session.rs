use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single sitting of a class during which attendance is collected.
///
/// Sessions move `Open -> Closed` exactly once. Events are accepted only while
/// the session is open; a closed session keeps serving the verdicts computed
/// from the events it already holds. At most one session per class is open at a
/// time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassSession {
    pub id: Uuid,
    pub class_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    /// Set when the session is closed.
    pub end_time: Option<DateTime<Utc>>,
    /// Caller that opened the session.
    pub opened_by: String,
}

impl ClassSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

/// Lifecycle state of a class session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Input for opening a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionInput {
    pub class_id: String,
    /// Defaults to the current time.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl OpenSessionInput {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            start_time: None,
        }
    }

    pub fn starting_at(class_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            class_id: class_id.into(),
            start_time: Some(start_time),
        }
    }
}
