use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::AppError,
    extractors::AppJson,
    models::{submission::SubmitAnswerRequest, user::Identity},
    services::AppState,
};

pub async fn generate_problem(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!("Generating problem for user_id={}", identity.user_id);

    let response = state.problems.generate(&identity).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    AppJson(req): AppJson<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(
        "Submitting answer for session_id={}, user_id={}",
        req.session_id,
        identity.user_id
    );

    let response = state.submissions.submit(&identity, req).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.problems.session_view(&identity, &session_id).await?;
    Ok(Json(view))
}

pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(submission_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .submissions
        .submission_view(&identity, &submission_id)
        .await?;
    Ok(Json(view))
}
