use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use enroll_core::{ApplyOutcome, CoursePreference, RegistrationError, SeatLabel};

use crate::AppState;

/// Create the HTTP router with all REST endpoints.
pub fn create_http_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/registration/courses", get(list_courses))
        .route("/api/registration/classroom/:course_id", get(classroom_state))
        .route("/api/registration/apply", post(apply))
        .route("/api/registration/book-seat", post(book_seat))
        .route("/api/registration/drop", post(drop_enrollment))
        .route("/api/registration/waitlist/:course_id", get(waitlist))
        .route("/api/registration/allocate", post(run_allocation))
        .route("/api/registration/student/:id/status", get(student_status))
        .route(
            "/api/registration/student/:id/preferences",
            get(student_preferences),
        )
        .route("/api/registration/preferences", post(replace_preferences))
        .route(
            "/api/registration/course/:id/open-booking",
            post(open_booking),
        )
        .route(
            "/api/registration/course/:id/close-booking",
            post(close_booking),
        )
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_courses(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let courses = state.service.list_courses().await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "courses": courses,
    })))
}

async fn classroom_state(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let classroom = state.service.classroom_state(&course_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "classroom": classroom,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyRequest {
    student_id: String,
    course_id: String,
    preferred_seat: Option<String>,
    #[serde(default)]
    auto_register: bool,
}

async fn apply(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ApplyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let preferred_seat = parse_seat(payload.preferred_seat.as_deref())?;
    let outcome = state
        .service
        .apply(
            &payload.student_id,
            &payload.course_id,
            preferred_seat,
            payload.auto_register,
        )
        .await?;

    let response = match &outcome {
        ApplyOutcome::Enrolled { seat_label, .. } => json!({
            "success": true,
            "status": "enrolled",
            "message": format!("Seat {seat_label} booked"),
            "result": outcome,
        }),
        ApplyOutcome::Waitlisted { position, .. } => json!({
            "success": true,
            "status": "waitlisted",
            "message": format!("Waitlisted at position {position}"),
            "result": outcome,
        }),
    };
    Ok(Json(response))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookSeatRequest {
    student_id: String,
    course_id: String,
    seat_number: String,
}

async fn book_seat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BookSeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let seat = payload
        .seat_number
        .parse::<SeatLabel>()
        .map_err(|_| RegistrationError::InvalidSeatLabel(payload.seat_number.clone()))?;
    let booking = state
        .service
        .book_specific_seat(&payload.student_id, &payload.course_id, seat)
        .await?;

    Ok(Json(json!({
        "success": true,
        "status": "enrolled",
        "message": format!("Seat {} booked", booking.seat_label),
        "booking": booking,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropRequest {
    student_id: String,
    course_id: String,
}

async fn drop_enrollment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DropRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .service
        .drop_enrollment(&payload.student_id, &payload.course_id)
        .await?;

    let message = match &outcome.released_seat {
        Some(seat) => format!("Seat {seat} released"),
        None => "No active booking to drop".to_string(),
    };
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "message": message,
        "result": outcome,
    })))
}

#[derive(Deserialize)]
struct WaitlistQuery {
    limit: Option<usize>,
}

async fn waitlist(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
    Query(query): Query<WaitlistQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(10);
    let entries = state.service.waitlist_top(&course_id, limit).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "courseId": course_id,
        "waitlist": entries,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest {
    course_ids: Option<Vec<String>>,
}

async fn run_allocation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AllocateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let report = state
        .service
        .run_allocation(payload.course_ids.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "report": report,
    })))
}

async fn student_status(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.service.student_status(&student_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "student": status,
    })))
}

async fn student_preferences(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let preferences = state.service.student_preferences(&student_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "studentId": student_id,
        "preferences": preferences,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceItem {
    course_id: String,
    priority: u32,
    #[serde(default)]
    match_reason: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesRequest {
    student_id: String,
    preferences: Vec<PreferenceItem>,
}

async fn replace_preferences(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PreferencesRequest>,
) -> Result<impl IntoResponse, AppError> {
    let prefs: Vec<CoursePreference> = payload
        .preferences
        .into_iter()
        .map(|item| CoursePreference {
            student_id: payload.student_id.clone(),
            course_id: item.course_id,
            priority: item.priority,
            match_reason: item.match_reason,
        })
        .collect();
    let count = prefs.len();
    state
        .service
        .replace_preferences(&payload.student_id, prefs)
        .await?;

    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "message": format!("{count} preferences saved"),
    })))
}

async fn open_booking(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.service.open_booking(&course_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "message": format!("Booking opened for {course_id}"),
    })))
}

async fn close_booking(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.service.close_booking(&course_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": "ok",
        "message": format!("Booking closed for {course_id}"),
        "report": report,
    })))
}

fn parse_seat(raw: Option<&str>) -> Result<Option<SeatLabel>, AppError> {
    raw.map(|s| {
        s.parse::<SeatLabel>()
            .map_err(|_| AppError(RegistrationError::InvalidSeatLabel(s.to_string())))
    })
    .transpose()
}

/// Wraps the core error so it can render as an HTTP response.
pub struct AppError(pub RegistrationError);

impl From<RegistrationError> for AppError {
    fn from(err: RegistrationError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let err = self.0;
        let status = match &err {
            RegistrationError::StudentNotFound(_) | RegistrationError::CourseNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RegistrationError::InvalidSeatLabel(_)
            | RegistrationError::ConfigurationInvalid(_) => StatusCode::BAD_REQUEST,
            RegistrationError::Conflict(_) => StatusCode::CONFLICT,
            RegistrationError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RegistrationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::CONFLICT,
        };
        let envelope = if err.is_rejection() { "rejected" } else { "error" };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }

        let body = Json(json!({
            "success": false,
            "status": envelope,
            "code": err.code(),
            "message": err.to_string(),
        }));
        (status, body).into_response()
    }
}
