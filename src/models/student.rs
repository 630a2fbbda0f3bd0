use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A roster entry. The RFID tag is unique across the roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub rfid_tag: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStudentInput {
    pub name: String,
    pub rfid_tag: String,
}

/// Response body of the roster listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentList {
    pub students: Vec<Student>,
}

/// Per-class attendance figures for one student.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassAttendance {
    pub class_id: String,
    /// Sessions with at least one RFID scan by the student.
    pub sessions_attended: u32,
    pub total_sessions: u32,
    /// `sessions_attended / total_sessions` as a percentage, rounded to two
    /// decimals.
    pub attendance_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub student_id: Uuid,
    pub classes: Vec<ClassAttendance>,
}
