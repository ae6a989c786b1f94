use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::Validate;

/// JSON body extractor that answers malformed or invalid bodies with a JSON
/// `{"error": ...}` instead of axum's plain-text rejection.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let value = match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => value,
            Err(rejection) => {
                let message = format!("Failed to parse JSON request body: {}", rejection);
                tracing::warn!("{}", message);
                return Err(
                    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
                );
            }
        };

        if let Err(errors) = value.validate() {
            tracing::warn!(%errors, "Request body failed validation");
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Invalid request body: {}", errors) })),
            )
                .into_response());
        }

        Ok(AppJson(value))
    }
}
