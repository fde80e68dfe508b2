// src/handlers/exam.rs

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use validator::Validate;

use crate::{
    config::LEADERBOARD_LIMIT,
    error::AppError,
    models::attempt::StartAttemptResponse,
    state::AppState,
    utils::jwt::Claims,
};

#[derive(Debug, Deserialize, Validate)]
pub struct LeaderboardParams {
    #[validate(range(min = 1, max = 50, message = "Limit must be between 1 and 50."))]
    pub limit: Option<i64>,
}

/// Starts (or returns the existing) attempt of the caller on an exam.
///
/// The start time is fixed here and anchors the attempt's deadline.
pub async fn start_attempt(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let deps = state.deps();

    let exam = deps.catalog.load_exam(exam_id).await.map_err(|e| {
        tracing::error!("Failed to load exam {}: {:?}", exam_id, e);
        AppError::from(e)
    })?;

    let attempt = deps
        .store
        .create_attempt(exam_id, user_id, deps.clock.now())
        .await
        .map_err(|e| {
            tracing::error!("Failed to create attempt on exam {}: {:?}", exam_id, e);
            AppError::from(e)
        })?;

    tracing::info!(
        "User {} started attempt {} on exam {}",
        user_id,
        attempt.id,
        exam_id
    );

    Ok((
        StatusCode::CREATED,
        Json(StartAttemptResponse {
            attempt_id: attempt.id,
            exam_id,
            start_time: attempt.start_time,
            duration_seconds: exam.duration_seconds,
            is_submitted: attempt.is_submitted,
        }),
    ))
}

/// Finalized attempts ranked by score.
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
    Query(params): Query<LeaderboardParams>,
) -> Result<impl IntoResponse, AppError> {
    params.validate()?;
    let limit = params.limit.unwrap_or(LEADERBOARD_LIMIT);

    let entries = state
        .deps()
        .store
        .ranked_results(exam_id, limit)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch leaderboard: {:?}", e);
            AppError::from(e)
        })?;

    Ok(Json(entries))
}
