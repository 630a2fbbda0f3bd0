//! Bucketing of a session's events into fixed-size windows.
//!
//! Windows start at the session start and follow each other without gaps or
//! overlap. The last window is the one holding the latest event, or for a
//! closed session the one reaching its end time, whichever comes later. A
//! session with no events still yields one window.
//!
//! Aggregation is a single forward pass over events ordered by
//! `(timestamp, seq)`. Scans count toward the window they fall in, half-open.
//! Headcounts are snapshots: each window reports the most recent headcount
//! observed at or before its end, carried over from earlier windows.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::iter::Peekable;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::{EventIter, EventQuery};
use crate::error::{Error, Result};
use crate::models::*;

pub const DEFAULT_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct WindowAggregator {
    window_size: Duration,
}

impl WindowAggregator {
    /// Window sizes are kept at millisecond precision, like stored timestamps.
    pub fn new(window_size: Duration) -> Result<Self> {
        let millis = window_size.num_milliseconds();
        if millis < 1 {
            return Err(Error::InvalidWindow(format!(
                "window size must be at least 1ms, got {}ms",
                millis
            )));
        }
        Ok(Self {
            window_size: Duration::milliseconds(millis),
        })
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Lazily bucket `events` (ordered by timestamp, then sequence) into the
    /// windows of `session`.
    pub fn aggregate<I>(&self, session: &ClassSession, events: I) -> Windows<I::IntoIter>
    where
        I: IntoIterator<Item = Result<AttendanceEvent>>,
    {
        Windows {
            session_id: session.id,
            next_start: session.start_time,
            window_size: self.window_size,
            end_time: session.end_time,
            events: events.into_iter().peekable(),
            boundary: VecDeque::new(),
            headcount: None,
            emitted: false,
            done: false,
        }
    }

    /// A restartable window series over a point-in-time event query.
    pub fn session_windows(&self, session: ClassSession, events: EventQuery) -> SessionWindows {
        SessionWindows {
            session,
            events,
            aggregator: *self,
        }
    }

    /// Start of the last window of `session`, given its latest event.
    fn last_window_start(
        &self,
        session: &ClassSession,
        last_event: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let start = session.start_time;
        let one_ms = Duration::milliseconds(1);
        let span_end = [last_event.map(|t| t + one_ms), session.end_time]
            .into_iter()
            .flatten()
            .fold(start + one_ms, |a, b| a.max(b));

        let size = self.window_size.num_milliseconds();
        let index = ((span_end - start).num_milliseconds() - 1) / size;
        start + Duration::milliseconds(index * size)
    }

    /// The single window starting at `window_start`. Reads `events` only up to
    /// the window end.
    fn window_at<I>(&self, session_id: Uuid, window_start: DateTime<Utc>, events: I) -> Result<Window>
    where
        I: IntoIterator<Item = Result<AttendanceEvent>>,
    {
        let window_end = window_start + self.window_size;
        let mut tally = Tally::default();
        let mut headcount = None;

        for event in events {
            let event = event?;
            if event.timestamp > window_end {
                break;
            }
            match event.source {
                EventSource::Headcount => observe_headcount(&mut headcount, &event),
                EventSource::Rfid if event.timestamp >= window_start && event.timestamp < window_end => {
                    tally.scan(event)
                }
                EventSource::Rfid => {}
            }
        }

        Ok(tally.into_window(session_id, window_start, window_end, headcount))
    }
}

impl Default for WindowAggregator {
    fn default() -> Self {
        Self {
            window_size: Duration::seconds(DEFAULT_WINDOW_SECS),
        }
    }
}

#[derive(Default)]
struct Tally {
    subjects: HashSet<String>,
    rfid_events: u32,
}

impl Tally {
    fn scan(&mut self, event: AttendanceEvent) {
        self.rfid_events += 1;
        if let Some(subject) = event.subject_id {
            self.subjects.insert(subject);
        }
    }

    fn into_window(
        self,
        session_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        headcount: Option<u32>,
    ) -> Window {
        Window {
            session_id,
            window_start,
            window_end,
            rfid_count: self.subjects.len() as u32,
            rfid_events: self.rfid_events,
            headcount,
        }
    }
}

fn observe_headcount(current: &mut Option<u32>, event: &AttendanceEvent) {
    if event.count.is_some() {
        *current = event.count;
    }
}

pub struct Windows<I: Iterator<Item = Result<AttendanceEvent>>> {
    session_id: Uuid,
    next_start: DateTime<Utc>,
    window_size: Duration,
    end_time: Option<DateTime<Utc>>,
    events: Peekable<I>,
    /// Events dated exactly at the previous window's end. Their headcounts were
    /// already observed by that window; everything else about them belongs to
    /// the next one.
    boundary: VecDeque<AttendanceEvent>,
    headcount: Option<u32>,
    emitted: bool,
    done: bool,
}

impl<I: Iterator<Item = Result<AttendanceEvent>>> Windows<I> {
    fn has_more(&mut self) -> bool {
        if !self.emitted || !self.boundary.is_empty() {
            return true;
        }
        if self.events.peek().is_some() {
            return true;
        }
        self.end_time.is_some_and(|end| self.next_start < end)
    }

    fn observe(&mut self, event: AttendanceEvent, tally: &mut Tally) {
        match event.source {
            EventSource::Rfid => tally.scan(event),
            EventSource::Headcount => observe_headcount(&mut self.headcount, &event),
        }
    }
}

impl<I: Iterator<Item = Result<AttendanceEvent>>> Iterator for Windows<I> {
    type Item = Result<Window>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || !self.has_more() {
            self.done = true;
            return None;
        }

        let window_start = self.next_start;
        let window_end = window_start + self.window_size;
        let mut tally = Tally::default();

        for event in std::mem::take(&mut self.boundary) {
            self.observe(event, &mut tally);
        }

        loop {
            let position = match self.events.peek() {
                Some(Ok(event)) => event.timestamp.cmp(&window_end),
                Some(Err(_)) => Ordering::Less,
                None => break,
            };
            if position == Ordering::Greater {
                break;
            }

            let event = match self.events.next() {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => break,
            };
            if position == Ordering::Equal {
                if event.source == EventSource::Headcount {
                    observe_headcount(&mut self.headcount, &event);
                }
                self.boundary.push_back(event);
            } else {
                self.observe(event, &mut tally);
            }
        }

        self.next_start = window_end;
        self.emitted = true;

        Some(Ok(tally.into_window(
            self.session_id,
            window_start,
            window_end,
            self.headcount,
        )))
    }
}

/// Windows of one session over a fixed event snapshot. Iterate as often as
/// needed; every pass yields the same windows.
#[derive(Clone)]
pub struct SessionWindows {
    session: ClassSession,
    events: EventQuery,
    aggregator: WindowAggregator,
}

impl SessionWindows {
    pub fn session(&self) -> &ClassSession {
        &self.session
    }

    pub fn iter(&self) -> Windows<EventIter> {
        self.aggregator.aggregate(&self.session, self.events.iter())
    }

    /// The most recent window of the session. Its position is computed from
    /// the latest event, so the cost does not grow with the number of windows.
    pub fn latest(&self) -> Result<Window> {
        let last_event = self.events.last_timestamp()?;
        let window_start = self.aggregator.last_window_start(&self.session, last_event);
        self.aggregator
            .window_at(self.session.id, window_start, self.events.iter())
    }
}

impl IntoIterator for &SessionWindows {
    type Item = Result<Window>;
    type IntoIter = Windows<EventIter>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
