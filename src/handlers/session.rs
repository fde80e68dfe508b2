// src/handlers/session.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use validator::{Validate, ValidationError};

use crate::{
    engine::{Phase, violation::Signal},
    error::AppError,
    models::{
        attempt::{Attempt, AttemptResultResponse},
        question::PublicQuestion,
    },
    state::AppState,
    utils::jwt::Claims,
};

#[derive(Debug, Deserialize, Validate)]
pub struct SetAnswerRequest {
    #[validate(length(min = 1, max = 26, message = "Selection must hold between 1 and 26 values."))]
    pub selection: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignalRequest {
    #[validate(custom(function = "validate_signal"))]
    pub signal: Signal,
}

fn validate_signal(signal: &Signal) -> Result<(), ValidationError> {
    if let Signal::KeyPressed { key, .. } = signal {
        if key.is_empty() || key.len() > 32 {
            return Err(ValidationError::new("key_length")
                .with_message("Key name must be between 1 and 32 characters.".into()));
        }
    }
    Ok(())
}

/// Loads an attempt straight from the store and checks it belongs to the caller.
async fn owned_attempt(
    state: &AppState,
    attempt_id: i64,
    user_id: i64,
) -> Result<Attempt, AppError> {
    let attempt = state
        .deps()
        .store
        .load_attempt(attempt_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load attempt {}: {:?}", attempt_id, e);
            AppError::from(e)
        })?;

    if attempt.user_id != user_id {
        return Err(AppError::Forbidden(format!(
            "Attempt {} belongs to another learner",
            attempt_id
        )));
    }
    Ok(attempt)
}

/// Opens the session for an attempt, resuming it if it was interrupted.
pub async fn open_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let handle = state.sessions.open(attempt_id, user_id).await?;
    Ok(Json(handle.refresh().await))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    Ok(Json(handle.refresh().await))
}

/// Stops the session's timers and monitors. Saved answers are kept.
pub async fn close_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state
        .sessions
        .dispose(attempt_id, claims.user_id()?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Questions of the attempt's exam, without answer keys.
pub async fn list_questions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let attempt = owned_attempt(&state, attempt_id, claims.user_id()?).await?;

    let questions = state
        .deps()
        .catalog
        .list_questions(attempt.exam_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to list questions of exam {}: {:?}", attempt.exam_id, e);
            AppError::from(e)
        })?;

    let questions: Vec<PublicQuestion> = questions.iter().map(PublicQuestion::from).collect();
    Ok(Json(questions))
}

pub async fn visit_question(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((attempt_id, question_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let status = handle.visit(question_id).await?;
    Ok(Json(json!({ "question_id": question_id, "status": status })))
}

pub async fn set_answer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((attempt_id, question_id)): Path<(i64, i64)>,
    Json(payload): Json<SetAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let status = handle.set_answer(question_id, payload.selection).await?;
    Ok(Json(json!({ "question_id": question_id, "status": status })))
}

pub async fn reset_answer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((attempt_id, question_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let status = handle.reset_answer(question_id).await?;
    Ok(Json(json!({ "question_id": question_id, "status": status })))
}

pub async fn toggle_review(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((attempt_id, question_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let status = handle.toggle_review(question_id).await?;
    Ok(Json(json!({ "question_id": question_id, "status": status })))
}

/// Environment signal from the client (tab hidden, key pressed, ...).
pub async fn report_signal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
    Json(payload): Json<SignalRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let outcome = handle.observe(payload.signal).await?;
    Ok(Json(outcome))
}

pub async fn dismiss_warning(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    handle.dismiss_warning().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Learner-initiated submission.
///
/// Returns 200 once the result is stored, or 202 while the store is down and
/// the session keeps retrying in the background.
pub async fn submit(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !payload.confirm {
        return Err(AppError::BadRequest(
            "Submission must be confirmed".to_string(),
        ));
    }

    let handle = state.sessions.get(attempt_id, claims.user_id()?).await?;
    let snapshot = handle.submit().await?;

    let status = match snapshot.phase {
        Phase::Submitted => StatusCode::OK,
        _ => StatusCode::ACCEPTED,
    };
    Ok((status, Json(snapshot)))
}

/// The finalized result, read from the store.
pub async fn get_result(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let attempt = owned_attempt(&state, attempt_id, claims.user_id()?).await?;

    let result = match (attempt.is_submitted, attempt.result) {
        (true, Some(result)) => result,
        _ => {
            return Err(AppError::Conflict(format!(
                "Attempt {} has not been submitted",
                attempt_id
            )));
        }
    };

    Ok(Json(AttemptResultResponse {
        attempt_id: attempt.id,
        exam_id: attempt.exam_id,
        answers: attempt.answers,
        question_status: attempt.question_status,
        violation_counts: attempt.violation_counts,
        result,
    }))
}
