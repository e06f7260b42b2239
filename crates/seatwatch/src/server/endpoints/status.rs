use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::server::AppState;

/// GET /health
/// Returns the scrape loop status and the number of stored offerings
pub async fn get_health(State(s): State<Arc<AppState>>) -> Response {
    info!("GET /health");

    let status = s.status.borrow().clone();
    let offerings = s.offerings.count().ok();

    (
        StatusCode::OK,
        Json(json!({
            "status": if offerings.is_some() { "ok" } else { "degraded" },
            "loop": status,
            "offerings": offerings,
        })),
    )
        .into_response()
}
