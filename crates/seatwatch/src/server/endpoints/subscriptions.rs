use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::server::types::ApiErrorType;
use crate::server::AppState;
use crate::types::WatchCode;

/// GET /subscriptions/:code/count
pub async fn get_subscription_count(
    Path(code): Path<String>,
    State(s): State<Arc<AppState>>,
) -> Response {
    info!("GET /subscriptions/{}/count", code);

    let code = match WatchCode::parse(&code) {
        Ok(code) => code,
        Err(e) => return ApiErrorType::from(e).into_response(),
    };

    match s.subscriptions.count_by_subject(code.as_str()) {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({ "code": code.as_str(), "count": count })),
        )
            .into_response(),
        Err(e) => ApiErrorType::from(e).into_response(),
    }
}
