mod events;
mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

pub use events::{EventIter, EventQuery};

/// Events closer together than this, with the same dedup key, collapse into one.
pub const DEFAULT_DEDUP_TOLERANCE_SECS: i64 = 5;

/// How far ahead of the server clock an event or session start may be dated.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

const SESSION_COLUMNS: &str = "id, class_id, status, start_ms, end_ms, opened_by";

/// SQLite-backed event store, session registry and roster.
///
/// All access goes through one connection behind a mutex, which serializes
/// appends. Reads that span several statements use a sequence watermark (see
/// [`EventQuery`]) rather than holding the lock.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    dedup_tolerance: Duration,
}

impl Database {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_default() -> anyhow::Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "rollcall")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("rollcall.db"))
    }

    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            dedup_tolerance: Duration::seconds(DEFAULT_DEDUP_TOLERANCE_SECS),
        }
    }

    /// Set how far apart two events with the same dedup key may be and still be
    /// treated as one observation.
    pub fn with_dedup_tolerance(mut self, tolerance: Duration) -> Self {
        self.dedup_tolerance = tolerance;
        self
    }

    pub fn dedup_tolerance(&self) -> Duration {
        self.dedup_tolerance
    }

    pub fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Roster operations
    // ============================================================

    pub fn get_all_students(&self) -> Result<Vec<Student>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, rfid_tag, created_at FROM students ORDER BY name, rfid_tag",
        )?;

        let students = stmt
            .query_map([], student_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(students)
    }

    pub fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let student = conn
            .query_row(
                "SELECT id, name, rfid_tag, created_at FROM students WHERE id = ?",
                [id.to_string()],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    pub fn get_student_by_tag(&self, rfid_tag: &str) -> Result<Option<Student>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let student = conn
            .query_row(
                "SELECT id, name, rfid_tag, created_at FROM students WHERE rfid_tag = ?",
                [rfid_tag.trim()],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    pub fn create_student(&self, input: CreateStudentInput) -> Result<Student> {
        let name = input.name.trim().to_string();
        let rfid_tag = input.rfid_tag.trim().to_string();
        if name.is_empty() || rfid_tag.is_empty() {
            return Err(Error::invalid_event("student name and RFID tag are required"));
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM students WHERE rfid_tag = ?",
            [&rfid_tag],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Error::DuplicateTag(rfid_tag));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO students (id, name, rfid_tag, created_at) VALUES (?, ?, ?, ?)",
            (id.to_string(), &name, &rfid_tag, now.to_rfc3339()),
        )?;

        tracing::info!("Enrolled student {} with tag {}", name, rfid_tag);
        Ok(Student {
            id,
            name,
            rfid_tag,
            created_at: now,
        })
    }

    /// Per-class attendance for a student: sessions with at least one scan by
    /// the student, against all sessions held for that class.
    pub fn student_attendance(&self, student_id: Uuid) -> Result<AttendanceSummary> {
        self.get_student(student_id)?
            .ok_or(Error::UnknownStudent(student_id))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT s.class_id,
                    COUNT(DISTINCT s.id),
                    (SELECT COUNT(*) FROM class_sessions t WHERE t.class_id = s.class_id)
             FROM class_sessions s
             JOIN attendance_events e ON e.session_id = s.id
             WHERE e.source = 'rfid' AND e.subject_id = ?
             GROUP BY s.class_id
             ORDER BY s.class_id",
        )?;

        let classes = stmt
            .query_map([student_id.to_string()], |row| {
                let attended: u32 = row.get(1)?;
                let total: u32 = row.get(2)?;
                Ok(ClassAttendance {
                    class_id: row.get(0)?,
                    sessions_attended: attended,
                    total_sessions: total,
                    attendance_percentage: percentage(attended, total),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(AttendanceSummary {
            student_id,
            classes,
        })
    }

    // ============================================================
    // Session operations
    // ============================================================

    pub fn get_session(&self, id: Uuid) -> Result<Option<ClassSession>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_session(&conn, id)
    }

    /// Open a session for a class. Fails if the class already has one open.
    pub fn create_session(&self, input: OpenSessionInput, opened_by: &str) -> Result<ClassSession> {
        let class_id = input.class_id.trim().to_string();
        if class_id.is_empty() {
            return Err(Error::invalid_event("class_id is required"));
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let open: i64 = conn.query_row(
            "SELECT COUNT(*) FROM class_sessions WHERE class_id = ? AND status = 'open'",
            [&class_id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(Error::SessionAlreadyOpen(class_id));
        }

        let now = Utc::now();
        let start_time = truncate_ms(input.start_time.unwrap_or(now));
        if start_time > latest_acceptable(now) {
            return Err(Error::invalid_event(format!(
                "session start {} is in the future",
                start_time.to_rfc3339()
            )));
        }

        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO class_sessions (id, class_id, status, start_ms, end_ms, opened_by)
             VALUES (?, ?, 'open', ?, NULL, ?)",
            (
                id.to_string(),
                &class_id,
                start_time.timestamp_millis(),
                opened_by,
            ),
        )?;

        tracing::info!("Opened session {} for class {}", id, class_id);
        Ok(ClassSession {
            id,
            class_id,
            status: SessionStatus::Open,
            start_time,
            end_time: None,
            opened_by: opened_by.to_string(),
        })
    }

    /// Close an open session. The end time never precedes the start time.
    pub fn close_session(&self, id: Uuid, end_time: Option<DateTime<Utc>>) -> Result<ClassSession> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let session = load_session(&conn, id)?.ok_or(Error::UnknownSession(id))?;
        if !session.is_open() {
            return Err(Error::SessionClosed(id));
        }

        let now = Utc::now();
        let end_time = truncate_ms(end_time.unwrap_or(now)).max(session.start_time);
        if end_time > latest_acceptable(now) {
            return Err(Error::invalid_event(format!(
                "session end {} is in the future",
                end_time.to_rfc3339()
            )));
        }
        conn.execute(
            "UPDATE class_sessions SET status = 'closed', end_ms = ? WHERE id = ?",
            (end_time.timestamp_millis(), id.to_string()),
        )?;

        tracing::info!("Closed session {} for class {}", id, session.class_id);
        Ok(ClassSession {
            status: SessionStatus::Closed,
            end_time: Some(end_time),
            ..session
        })
    }

    /// All sessions of a class, oldest first.
    pub fn get_sessions_by_class(&self, class_id: &str) -> Result<Vec<ClassSession>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM class_sessions
             WHERE class_id = ? ORDER BY start_ms, rowid"
        ))?;

        let sessions = stmt
            .query_map([class_id], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(sessions)
    }

    /// The open session of a class if there is one, otherwise the most recently
    /// started session.
    pub fn latest_session_for_class(&self, class_id: &str) -> Result<Option<ClassSession>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM class_sessions
                     WHERE class_id = ?
                     ORDER BY status = 'open' DESC, start_ms DESC, rowid DESC
                     LIMIT 1"
                ),
                [class_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn open_session_for_class(&self, class_id: &str) -> Result<Option<ClassSession>> {
        Ok(self
            .latest_session_for_class(class_id)?
            .filter(ClassSession::is_open))
    }

    // ============================================================
    // Headcount series
    // ============================================================

    /// Every headcount recorded for a class, across sessions, oldest first.
    pub fn get_headcounts_by_class(&self, class_id: &str) -> Result<Vec<HeadcountPoint>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.count, e.occurred_ms
             FROM attendance_events e
             JOIN class_sessions s ON s.id = e.session_id
             WHERE s.class_id = ? AND e.source = 'headcount'
             ORDER BY e.occurred_ms, e.seq",
        )?;

        let points = stmt
            .query_map([class_id], |row| {
                Ok(HeadcountPoint {
                    count: row.get(0)?,
                    timestamp: from_ms(row.get(1)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(points)
    }

    /// Every RFID scan in the store, across classes, oldest first.
    pub fn get_all_scans(&self) -> Result<Vec<ScanRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.id, e.session_id, s.class_id, e.subject_id, e.occurred_ms
             FROM attendance_events e
             JOIN class_sessions s ON s.id = e.session_id
             WHERE e.source = 'rfid'
             ORDER BY e.occurred_ms, e.seq",
        )?;

        let scans = stmt
            .query_map([], |row| {
                Ok(ScanRecord {
                    id: parse_uuid(row.get(0)?),
                    session_id: parse_uuid(row.get(1)?),
                    class_id: row.get(2)?,
                    subject_id: row.get(3)?,
                    timestamp: from_ms(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(scans)
    }

    /// Every headcount in the store, across classes, oldest first.
    pub fn get_all_headcounts(&self) -> Result<Vec<HeadcountRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.id, e.session_id, s.class_id, e.count, e.occurred_ms
             FROM attendance_events e
             JOIN class_sessions s ON s.id = e.session_id
             WHERE e.source = 'headcount'
             ORDER BY e.occurred_ms, e.seq",
        )?;

        let headcounts = stmt
            .query_map([], |row| {
                Ok(HeadcountRecord {
                    id: parse_uuid(row.get(0)?),
                    session_id: parse_uuid(row.get(1)?),
                    class_id: row.get(2)?,
                    count: row.get(3)?,
                    timestamp: from_ms(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(headcounts)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            dedup_tolerance: self.dedup_tolerance,
        }
    }
}

fn load_session(conn: &Connection, id: Uuid) -> Result<Option<ClassSession>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM class_sessions WHERE id = ?"),
            [id.to_string()],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ClassSession> {
    Ok(ClassSession {
        id: parse_uuid(row.get::<_, String>(0)?),
        class_id: row.get(1)?,
        status: SessionStatus::from_str(&row.get::<_, String>(2)?).unwrap_or(SessionStatus::Open),
        start_time: from_ms(row.get(3)?),
        end_time: row.get::<_, Option<i64>>(4)?.map(from_ms),
        opened_by: row.get(5)?,
    })
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        rfid_tag: row.get(2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn percentage(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (f64::from(part) / f64::from(whole) * 10_000.0).round() / 100.0
}

/// Latest timestamp accepted when the server clock reads `now`.
pub(crate) fn latest_acceptable(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::seconds(MAX_CLOCK_SKEW_SECS)
}

/// Stored times have millisecond precision.
pub(crate) fn truncate_ms(at: DateTime<Utc>) -> DateTime<Utc> {
    from_ms(at.timestamp_millis())
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
