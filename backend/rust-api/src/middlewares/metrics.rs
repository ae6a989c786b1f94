use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Route label for requests no route matched. Keeps scans of arbitrary
/// paths from growing the label set.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Counts requests and observes their latency, labelled by the route
/// template (`/api/v1/problems/{session_id}`) rather than the raw path, so
/// session and submission ids never become label values.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let route = route_label(req.extensions().get::<MatchedPath>());

    let response = next.run(req).await;

    record_request(method.as_str(), &route, response.status(), started.elapsed());
    response
}

fn route_label(matched: Option<&MatchedPath>) -> String {
    matched
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

fn record_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, route, status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, route])
        .observe(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http, middleware, routing::get, Router};
    use tower::ServiceExt;

    const SUBMISSION_ROUTE: &str = "/api/v1/problems/submission/{submission_id}";

    fn app() -> Router {
        Router::new()
            .route(SUBMISSION_ROUTE, get(|| async { "ready" }))
            .layer(middleware::from_fn(metrics_middleware))
    }

    async fn get_path(path: &str) -> StatusCode {
        let request = http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn submissions_share_one_route_label() {
        let counter = HTTP_REQUESTS_TOTAL.with_label_values(&["GET", SUBMISSION_ROUTE, "200"]);
        let latency = HTTP_REQUEST_DURATION_SECONDS.with_label_values(&["GET", SUBMISSION_ROUTE]);
        let (count_before, samples_before) = (counter.get(), latency.get_sample_count());

        assert_eq!(get_path("/api/v1/problems/submission/sub-1").await, StatusCode::OK);
        assert_eq!(
            get_path("/api/v1/problems/submission/550e8400-e29b-41d4-a716-446655440000").await,
            StatusCode::OK
        );

        assert_eq!(counter.get() - count_before, 2);
        assert_eq!(latency.get_sample_count() - samples_before, 2);
        assert_eq!(
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["GET", "/api/v1/problems/submission/sub-1", "200"])
                .get(),
            0
        );
    }

    #[test]
    fn requests_without_a_route_are_pooled() {
        assert_eq!(route_label(None), UNMATCHED_ROUTE);
    }

    #[test]
    fn status_is_recorded_as_its_code() {
        let counter = HTTP_REQUESTS_TOTAL.with_label_values(&["POST", "/api/v1/problems/submit", "409"]);
        let before = counter.get();
        record_request(
            "POST",
            "/api/v1/problems/submit",
            StatusCode::CONFLICT,
            Duration::from_millis(3),
        );
        assert_eq!(counter.get() - before, 1);
    }
}
