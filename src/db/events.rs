//! Append-only attendance event log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    from_ms, latest_acceptable, load_session, parse_datetime, parse_uuid, truncate_ms, Database,
};
use crate::error::{Error, Result};
use crate::models::*;

const EVENT_COLUMNS: &str =
    "seq, id, session_id, source, subject_id, count, dedup_key, occurred_ms, recorded_by, recorded_at";

const DEFAULT_PAGE_SIZE: usize = 256;

impl Database {
    /// Append an event to an open session.
    ///
    /// If the session already holds an event from the same source with the same
    /// dedup key, no further apart than the dedup tolerance, nothing is written
    /// and the stored event is returned as [`AppendOutcome::Deduplicated`].
    /// The duplicate check and the insert run in one transaction.
    pub fn append_event(
        &self,
        session_id: Uuid,
        input: EventInput,
        recorded_by: &str,
    ) -> Result<AppendOutcome> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let session = load_session(&tx, session_id)?.ok_or(Error::UnknownSession(session_id))?;
        if !session.is_open() {
            return Err(Error::SessionClosed(session_id));
        }

        let timestamp = truncate_ms(input.timestamp.unwrap_or_else(Utc::now));
        let count = validate_event(&session, &input, timestamp)?;
        let dedup_key = input.effective_dedup_key();

        if let Some(key) = &dedup_key {
            let tolerance = self.dedup_tolerance.num_milliseconds().max(0);
            let at = timestamp.timestamp_millis();
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM attendance_events
                         WHERE session_id = ? AND source = ? AND dedup_key = ?
                           AND occurred_ms BETWEEN ? AND ?
                         ORDER BY occurred_ms, seq
                         LIMIT 1"
                    ),
                    (
                        session_id.to_string(),
                        input.source.as_str(),
                        key,
                        at.saturating_sub(tolerance),
                        at.saturating_add(tolerance),
                    ),
                    event_from_row,
                )
                .optional()?;

            if let Some(existing) = existing {
                tracing::debug!(
                    "Dropped repeat {} event for key {} in session {}",
                    input.source.as_str(),
                    key,
                    session_id
                );
                return Ok(AppendOutcome::Deduplicated { existing });
            }
        }

        let id = Uuid::new_v4();
        let recorded_at = Utc::now();
        let subject_id = match input.source {
            EventSource::Rfid => input.subject_id.as_deref().map(str::trim).map(String::from),
            EventSource::Headcount => None,
        };

        tx.execute(
            "INSERT INTO attendance_events
                (id, session_id, source, subject_id, count, dedup_key, occurred_ms, recorded_by, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                session_id.to_string(),
                input.source.as_str(),
                &subject_id,
                count,
                &dedup_key,
                timestamp.timestamp_millis(),
                recorded_by,
                recorded_at.to_rfc3339(),
            ),
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(
            "Recorded {} event {} (seq {}) in session {}",
            input.source.as_str(),
            id,
            seq,
            session_id
        );

        Ok(AppendOutcome::Recorded {
            event: AttendanceEvent {
                id,
                seq,
                session_id,
                source: input.source,
                subject_id,
                count,
                dedup_key,
                timestamp,
                recorded_by: recorded_by.to_string(),
                recorded_at,
            },
        })
    }

    /// Events of a session inside `range`, ordered by timestamp then sequence.
    ///
    /// The returned query is pinned to the events stored at the time of this
    /// call: iterating it again, even after further appends, yields the same
    /// events.
    pub fn query_events(&self, session_id: Uuid, range: TimeRange) -> Result<EventQuery> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_session(&conn, session_id)?.ok_or(Error::UnknownSession(session_id))?;
        let watermark = current_watermark(&conn)?;

        Ok(EventQuery {
            db: self.clone(),
            session_id,
            range,
            watermark,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Highest sequence number stored so far.
    pub fn watermark(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("database lock poisoned");
        current_watermark(&conn)
    }

    fn events_page(
        &self,
        query: &EventQuery,
        after: Option<(i64, i64)>,
    ) -> Result<Vec<AttendanceEvent>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM attendance_events
             WHERE session_id = ?1 AND seq <= ?2
               AND occurred_ms >= ?3 AND occurred_ms < ?4
               AND (occurred_ms > ?5 OR (occurred_ms = ?5 AND seq > ?6))
             ORDER BY occurred_ms, seq
             LIMIT ?7"
        ))?;

        let (after_ms, after_seq) = after.unwrap_or((i64::MIN, i64::MIN));
        let events = stmt
            .query_map(
                (
                    query.session_id.to_string(),
                    query.watermark,
                    query.range.from.map_or(i64::MIN, |t| t.timestamp_millis()),
                    query.range.to.map_or(i64::MAX, |t| t.timestamp_millis()),
                    after_ms,
                    after_seq,
                    query.page_size as i64,
                ),
                event_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    fn last_event_ms(&self, query: &EventQuery) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let last = conn.query_row(
            "SELECT MAX(occurred_ms) FROM attendance_events
             WHERE session_id = ?1 AND seq <= ?2
               AND occurred_ms >= ?3 AND occurred_ms < ?4",
            (
                query.session_id.to_string(),
                query.watermark,
                query.range.from.map_or(i64::MIN, |t| t.timestamp_millis()),
                query.range.to.map_or(i64::MAX, |t| t.timestamp_millis()),
            ),
            |row| row.get(0),
        )?;
        Ok(last)
    }
}

/// A restartable, point-in-time view over a session's events.
///
/// Nothing is read until iteration starts; rows are then fetched in pages, each
/// page taking the store lock only for its own statement. Every iterator created
/// from the same query sees exactly the events that existed when the query was
/// made. Dropping an iterator part way needs no cleanup.
#[derive(Clone)]
pub struct EventQuery {
    db: Database,
    session_id: Uuid,
    range: TimeRange,
    watermark: i64,
    page_size: usize,
}

impl EventQuery {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Timestamp of the latest event in the snapshot.
    pub fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.last_event_ms(self)?.map(from_ms))
    }

    pub fn iter(&self) -> EventIter {
        EventIter {
            query: self.clone(),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }
}

impl IntoIterator for &EventQuery {
    type Item = Result<AttendanceEvent>;
    type IntoIter = EventIter;

    fn into_iter(self) -> EventIter {
        self.iter()
    }
}

pub struct EventIter {
    query: EventQuery,
    buffer: VecDeque<AttendanceEvent>,
    cursor: Option<(i64, i64)>,
    exhausted: bool,
}

impl Iterator for EventIter {
    type Item = Result<AttendanceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.buffer.pop_front() {
            return Some(Ok(event));
        }
        if self.exhausted {
            return None;
        }

        match self.query.db.events_page(&self.query, self.cursor) {
            Ok(page) => {
                if page.len() < self.query.page_size {
                    self.exhausted = true;
                }
                if let Some(last) = page.last() {
                    self.cursor = Some((last.timestamp.timestamp_millis(), last.seq));
                }
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

fn current_watermark(conn: &Connection) -> Result<i64> {
    let seq = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM attendance_events",
        [],
        |row| row.get(0),
    )?;
    Ok(seq)
}

/// Check the shape of an event against its source and session. Returns the
/// headcount to store, if any.
fn validate_event(
    session: &ClassSession,
    input: &EventInput,
    timestamp: DateTime<Utc>,
) -> Result<Option<u32>> {
    if timestamp < session.start_time {
        return Err(Error::invalid_event(format!(
            "timestamp {} is before the session start {}",
            timestamp.to_rfc3339(),
            session.start_time.to_rfc3339()
        )));
    }
    if timestamp > latest_acceptable(Utc::now()) {
        return Err(Error::invalid_event(format!(
            "timestamp {} is in the future",
            timestamp.to_rfc3339()
        )));
    }

    match input.source {
        EventSource::Rfid => {
            if input.count.is_some() {
                return Err(Error::invalid_event("rfid events do not carry a count"));
            }
            match input.subject_id.as_deref().map(str::trim) {
                Some(subject) if !subject.is_empty() => Ok(None),
                _ => Err(Error::invalid_event("rfid events require a subject_id")),
            }
        }
        EventSource::Headcount => {
            if input.subject_id.is_some() {
                return Err(Error::invalid_event(
                    "headcount events are not tied to a subject",
                ));
            }
            let count = input
                .count
                .ok_or_else(|| Error::invalid_event("headcount events require a count"))?;
            u32::try_from(count)
                .map(Some)
                .map_err(|_| Error::invalid_event(format!("invalid headcount {}", count)))
        }
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    Ok(AttendanceEvent {
        seq: row.get(0)?,
        id: parse_uuid(row.get::<_, String>(1)?),
        session_id: parse_uuid(row.get::<_, String>(2)?),
        source: EventSource::from_str(&row.get::<_, String>(3)?).unwrap_or(EventSource::Rfid),
        subject_id: row.get(4)?,
        count: row.get(5)?,
        dedup_key: row.get(6)?,
        timestamp: from_ms(row.get(7)?),
        recorded_by: row.get(8)?,
        recorded_at: parse_datetime(row.get::<_, String>(9)?),
    })
}
