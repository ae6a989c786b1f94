use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::AppError,
    models::job::{QueueName, QueueSummary},
    services::AppState,
};

/// Job counts for every queue.
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue_name in QueueName::ALL {
        let counts = state.queue.counts(queue_name).await?;
        queues.push(QueueSummary {
            name: queue_name.display_name(),
            queue_name,
            counts,
        });
    }

    Ok(Json(json!({
        "queues": queues,
        "hubConnections": state.hub.connection_count().await,
    })))
}
