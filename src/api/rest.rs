// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only liveness endpoints, no authentication:
//
//   GET /check           -> "Bot is running..."
//   GET /api/v1/health   -> uptime, live trackers, per-feed status
//
// CORS is permissive; nothing here mutates state.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

pub const CHECK_RESPONSE: &str = "Bot is running...";

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/check", get(check))
        .route("/api/v1/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn check() -> impl IntoResponse {
    Json(CHECK_RESPONSE)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: impl IntoResponse) -> serde_json::Value {
        let body = response.into_response().into_body();
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn check_answers_with_fixed_string() {
        let value = body_json(check().await).await;
        assert_eq!(value, serde_json::json!("Bot is running..."));
    }

    #[tokio::test]
    async fn health_reports_tracker_count() {
        let state = Arc::new(AppState::new(Vec::new()));
        state.set_open_trackers(2);
        let value = body_json(health(State(state)).await).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["open_trackers"], 2);
        assert!(value["feeds"].as_array().unwrap().is_empty());
    }

    #[test]
    fn router_builds() {
        let _ = router(Arc::new(AppState::new(Vec::new())));
    }
}
