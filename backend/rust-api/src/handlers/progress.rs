use axum::{extract::State, response::IntoResponse, Extension, Json};
use std::sync::Arc;

use crate::{error::AppError, models::user::Identity, services::AppState};

/// Caller's progress, earned badges and the full badge catalog.
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state.progress.summary(&identity.user_id).await?;
    Ok(Json(summary))
}
