use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::service::VerificationService;

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Roster
// ============================================================

pub async fn list_students(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<StudentList>> {
    tracing::debug!(caller = %caller, "listing students");
    let students = service.db().get_all_students()?;
    Ok(Json(StudentList { students }))
}

pub async fn create_student(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Json(input): Json<CreateStudentInput>,
) -> Result<(StatusCode, Json<Student>)> {
    tracing::debug!(caller = %caller, "enrolling student");
    service
        .db()
        .create_student(input)
        .map(|s| (StatusCode::CREATED, Json(s)))
}

pub async fn student_attendance(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<AttendanceSummary>> {
    tracing::debug!(caller = %caller, student_id = %id, "attendance summary requested");
    service.db().student_attendance(id).map(Json)
}

// ============================================================
// Sessions
// ============================================================

pub async fn open_session(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Json(input): Json<OpenSessionInput>,
) -> Result<(StatusCode, Json<ClassSession>)> {
    service
        .open_session(&caller, input)
        .map(|s| (StatusCode::CREATED, Json(s)))
}

pub async fn get_session(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClassSession>> {
    tracing::debug!(caller = %caller, session_id = %id, "session requested");
    service.get_session(id).map(Json)
}

pub async fn close_session(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClassSession>> {
    service.close_session(&caller, id).map(Json)
}

pub async fn list_class_sessions(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<String>,
) -> Result<Json<Vec<ClassSession>>> {
    tracing::debug!(caller = %caller, class_id, "listing class sessions");
    service.db().get_sessions_by_class(&class_id).map(Json)
}

pub async fn session_verdicts(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Verdict>>> {
    service.session_verdicts(&caller, id).map(Json)
}

// ============================================================
// Ingest
// ============================================================

/// Append a batch of events to a session. Always answers 200 once the session
/// path is valid; each event carries its own outcome.
pub async fn record_events(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(input): Json<BatchEventsInput>,
) -> Result<Json<BatchEventsResponse>> {
    service.get_session(id)?;
    let results = service.record_batch(&caller, id, input.events);
    Ok(Json(BatchEventsResponse { results }))
}

pub async fn record_scan(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Json(input): Json<RecordScanInput>,
) -> Result<(StatusCode, Json<AppendOutcome>)> {
    service.record_scan(&caller, input).map(append_response)
}

pub async fn record_headcount(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Json(input): Json<RecordHeadcountInput>,
) -> Result<(StatusCode, Json<AppendOutcome>)> {
    service.record_headcount(&caller, input).map(append_response)
}

pub async fn list_scans(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ScanList>> {
    let scans = service.scans(&caller)?;
    Ok(Json(ScanList { scans }))
}

pub async fn list_headcounts(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<HeadcountList>> {
    let headcounts = service.all_headcounts(&caller)?;
    Ok(Json(HeadcountList { headcounts }))
}

/// New events answer 201, collapsed repeats 200.
fn append_response(outcome: AppendOutcome) -> (StatusCode, Json<AppendOutcome>) {
    let status = if outcome.is_duplicate() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(outcome))
}

// ============================================================
// Verification
// ============================================================

pub async fn verify(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<String>,
) -> Result<Json<VerifyResponse>> {
    let verdict = service.current_verdict(&caller, &class_id)?;
    Ok(Json(VerifyResponse::new(class_id, &verdict)))
}

pub async fn headcounts(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<String>,
) -> Result<Json<Vec<HeadcountPoint>>> {
    service.headcounts(&caller, &class_id).map(Json)
}

pub async fn history(
    State(service): State<VerificationService>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<String>,
    Query(range): Query<TimeRange>,
) -> Result<Json<Vec<Window>>> {
    let history = service.history(&caller, &class_id, range)?;
    let windows = history.iter().collect::<Result<Vec<_>>>()?;
    Ok(Json(windows))
}
