//! Verification service: the entry point callers use.
//!
//! Wires the event store, the window aggregator and the reconciler together,
//! and keeps a short-lived cache of the latest verdict per class so that a room
//! full of polling dashboards does not recompute the same windows every few
//! seconds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::aggregate::{SessionWindows, WindowAggregator};
use crate::config::ServiceConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::*;
use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct VerificationService {
    db: Database,
    aggregator: WindowAggregator,
    reconciler: Reconciler,
    cache: VerdictCache,
}

impl VerificationService {
    /// Build a service over `db`. The store's dedup tolerance is taken from
    /// `config`.
    pub fn new(db: Database, config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            db: db.with_dedup_tolerance(config.dedup_tolerance),
            aggregator: WindowAggregator::new(config.window_size)?,
            reconciler: Reconciler::new(config.reconciler),
            cache: VerdictCache::new(config.cache_ttl),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    // ============================================================
    // Sessions
    // ============================================================

    pub fn open_session(&self, caller: &Caller, input: OpenSessionInput) -> Result<ClassSession> {
        let session = self.db.create_session(input, &caller.name)?;
        self.cache.invalidate_class(&session.class_id);
        tracing::debug!(caller = %caller, session_id = %session.id, "session opened");
        Ok(session)
    }

    pub fn close_session(&self, caller: &Caller, session_id: Uuid) -> Result<ClassSession> {
        let session = self.db.close_session(session_id, None)?;
        self.cache.invalidate_class(&session.class_id);
        tracing::debug!(caller = %caller, session_id = %session.id, "session closed");
        Ok(session)
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<ClassSession> {
        self.db
            .get_session(session_id)?
            .ok_or(Error::UnknownSession(session_id))
    }

    // ============================================================
    // Ingest
    // ============================================================

    pub fn record_event(
        &self,
        caller: &Caller,
        session_id: Uuid,
        input: EventInput,
    ) -> Result<AppendOutcome> {
        let outcome = self.db.append_event(session_id, input, &caller.name)?;
        if !outcome.is_duplicate() {
            self.cache.invalidate_session(session_id);
        }
        Ok(outcome)
    }

    /// Append several events, reporting each one's outcome separately. A
    /// rejected event does not stop the rest of the batch.
    pub fn record_batch(
        &self,
        caller: &Caller,
        session_id: Uuid,
        inputs: Vec<EventInput>,
    ) -> Vec<BatchEventResult> {
        inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| match self.record_event(caller, session_id, input) {
                Ok(AppendOutcome::Recorded { event }) => BatchEventResult {
                    index,
                    outcome: BatchOutcome::Recorded,
                    event: Some(event),
                    error: None,
                    message: None,
                },
                Ok(AppendOutcome::Deduplicated { existing }) => BatchEventResult {
                    index,
                    outcome: BatchOutcome::Deduplicated,
                    event: Some(existing),
                    error: None,
                    message: None,
                },
                Err(e) => {
                    tracing::warn!(caller = %caller, index, "batch event rejected: {}", e);
                    BatchEventResult {
                        index,
                        outcome: BatchOutcome::Rejected,
                        event: None,
                        error: Some(e.kind().to_string()),
                        message: Some(e.public_message()),
                    }
                }
            })
            .collect()
    }

    /// Record a reader's tag scan against the open session of its class.
    pub fn record_scan(&self, caller: &Caller, input: RecordScanInput) -> Result<AppendOutcome> {
        let student = self
            .db
            .get_student_by_tag(&input.rfid_tag)?
            .ok_or_else(|| Error::UnknownTag(input.rfid_tag.clone()))?;
        let session = self.open_session_for(&input.class_id)?;

        let event = EventInput {
            source: EventSource::Rfid,
            subject_id: Some(student.id.to_string()),
            count: None,
            dedup_key: None,
            timestamp: Some(input.timestamp.unwrap_or_else(Utc::now)),
        };
        self.record_event(caller, session.id, event)
    }

    /// Record a headcount against the open session of a class.
    pub fn record_headcount(
        &self,
        caller: &Caller,
        input: RecordHeadcountInput,
    ) -> Result<AppendOutcome> {
        let session = self.open_session_for(&input.class_id)?;
        let event = EventInput {
            source: EventSource::Headcount,
            subject_id: None,
            count: Some(input.count),
            dedup_key: None,
            timestamp: Some(input.timestamp.unwrap_or_else(Utc::now)),
        };
        self.record_event(caller, session.id, event)
    }

    fn open_session_for(&self, class_id: &str) -> Result<ClassSession> {
        match self.db.latest_session_for_class(class_id)? {
            Some(session) if session.is_open() => Ok(session),
            Some(session) => Err(Error::SessionClosed(session.id)),
            None => Err(Error::NoActiveSession(class_id.to_string())),
        }
    }

    // ============================================================
    // Queries
    // ============================================================

    /// Windows of a session over the events stored right now.
    pub fn session_windows(&self, session_id: Uuid) -> Result<SessionWindows> {
        let session = self.get_session(session_id)?;
        let events = self.db.query_events(session_id, TimeRange::all())?;
        Ok(self.aggregator.session_windows(session, events))
    }

    /// A verdict for every window of a session, oldest first.
    pub fn session_verdicts(&self, caller: &Caller, session_id: Uuid) -> Result<Vec<Verdict>> {
        tracing::debug!(caller = %caller, %session_id, "session verdicts requested");
        self.session_windows(session_id)?
            .iter()
            .map(|window| window.map(|w| self.reconciler.classify(&w)))
            .collect()
    }

    /// Verdict for the latest window of the class's current session: its open
    /// session, or failing that the most recently started one.
    pub fn current_verdict(&self, caller: &Caller, class_id: &str) -> Result<Verdict> {
        if let Some(verdict) = self.cache.get(class_id) {
            tracing::debug!(caller = %caller, class_id, "verdict served from cache");
            return Ok(verdict);
        }

        let epoch = self.cache.epoch();
        let session = self
            .db
            .latest_session_for_class(class_id)?
            .ok_or_else(|| Error::NoActiveSession(class_id.to_string()))?;
        let window = self.session_windows(session.id)?.latest()?;
        let verdict = self.reconciler.classify(&window);

        tracing::debug!(
            caller = %caller,
            class_id,
            status = verdict.status.as_str(),
            rfid_count = verdict.rfid_count,
            "verdict computed"
        );
        self.cache.put(class_id, verdict.clone(), epoch);
        Ok(verdict)
    }

    /// Windows of every session of a class that overlap `range`, oldest first.
    pub fn history(
        &self,
        caller: &Caller,
        class_id: &str,
        range: TimeRange,
    ) -> Result<WindowHistory> {
        let sessions = self.db.get_sessions_by_class(class_id)?;
        if sessions.is_empty() {
            return Err(Error::NoActiveSession(class_id.to_string()));
        }
        tracing::debug!(caller = %caller, class_id, sessions = sessions.len(), "history requested");

        let series = sessions
            .into_iter()
            .map(|session| {
                let events = self.db.query_events(session.id, TimeRange::all())?;
                Ok(self.aggregator.session_windows(session, events))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WindowHistory { series, range })
    }

    /// Headcount series of a class, oldest first. Empty for unknown classes.
    pub fn headcounts(&self, caller: &Caller, class_id: &str) -> Result<Vec<HeadcountPoint>> {
        tracing::debug!(caller = %caller, class_id, "headcounts requested");
        self.db.get_headcounts_by_class(class_id)
    }

    /// Every recorded scan, across classes.
    pub fn scans(&self, caller: &Caller) -> Result<Vec<ScanRecord>> {
        tracing::debug!(caller = %caller, "scan log requested");
        self.db.get_all_scans()
    }

    /// Every recorded headcount, across classes.
    pub fn all_headcounts(&self, caller: &Caller) -> Result<Vec<HeadcountRecord>> {
        tracing::debug!(caller = %caller, "headcount log requested");
        self.db.get_all_headcounts()
    }

    /// Whether a fresh verdict for `class_id` is currently cached.
    pub fn is_cached(&self, class_id: &str) -> bool {
        self.cache.get(class_id).is_some()
    }
}

/// Windows of several sessions of one class, restricted to a time range.
///
/// Lazy and restartable: each call to [`WindowHistory::iter`] walks the same
/// event snapshots again.
pub struct WindowHistory {
    series: Vec<SessionWindows>,
    range: TimeRange,
}

impl WindowHistory {
    pub fn sessions(&self) -> impl Iterator<Item = &ClassSession> {
        self.series.iter().map(SessionWindows::session)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Window>> + '_ {
        let range = self.range;
        self.series.iter().flat_map(move |windows| {
            windows
                .iter()
                .take_while(move |w| match (w, range.to) {
                    (Ok(w), Some(to)) => w.window_start < to,
                    _ => true,
                })
                .filter(move |w| match w {
                    Ok(w) => range.overlaps(w.window_start, w.window_end),
                    Err(_) => true,
                })
        })
    }
}

/// Latest verdict per class with time-based expiry.
///
/// Invalidation bumps an epoch; a verdict computed before the bump is not
/// stored, so an append racing with a recomputation cannot leave a stale entry
/// behind.
#[derive(Clone)]
struct VerdictCache {
    ttl: StdDuration,
    state: Arc<Mutex<CacheState>>,
}

#[derive(Default)]
struct CacheState {
    epoch: u64,
    entries: HashMap<String, CachedVerdict>,
}

struct CachedVerdict {
    verdict: Verdict,
    stored_at: Instant,
}

impl VerdictCache {
    fn new(ttl: StdDuration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn epoch(&self) -> u64 {
        self.state.lock().expect("verdict cache lock poisoned").epoch
    }

    fn get(&self, class_id: &str) -> Option<Verdict> {
        let mut state = self.state.lock().expect("verdict cache lock poisoned");
        match state.entries.get(class_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.verdict.clone()),
            Some(_) => {
                state.entries.remove(class_id);
                None
            }
            None => None,
        }
    }

    fn put(&self, class_id: &str, verdict: Verdict, epoch: u64) {
        if self.ttl.is_zero() {
            return;
        }
        let mut state = self.state.lock().expect("verdict cache lock poisoned");
        if state.epoch != epoch {
            return;
        }
        state.entries.insert(
            class_id.to_string(),
            CachedVerdict {
                verdict,
                stored_at: Instant::now(),
            },
        );
    }

    fn invalidate_class(&self, class_id: &str) {
        let mut state = self.state.lock().expect("verdict cache lock poisoned");
        state.epoch += 1;
        state.entries.remove(class_id);
    }

    fn invalidate_session(&self, session_id: Uuid) {
        let mut state = self.state.lock().expect("verdict cache lock poisoned");
        state.epoch += 1;
        state
            .entries
            .retain(|_, entry| entry.verdict.session_id != session_id);
    }
}
