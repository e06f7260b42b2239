use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::db::{DbOffering, OfferingRow, OfferingView};
use crate::server::types::ApiErrorType;
use crate::server::AppState;
use crate::types::WatchCode;

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    view: Option<String>,
    min: Option<u32>,
}

fn rows(offerings: &[DbOffering], view: OfferingView) -> Vec<OfferingRow> {
    offerings.iter().map(|o| o.project(view)).collect()
}

/// GET /offerings
/// Returns every stored offering joined with its subject
pub async fn get_all_offerings(State(s): State<Arc<AppState>>) -> Response {
    info!("GET /offerings");

    match s.offerings.query_all() {
        Ok(data) => (StatusCode::OK, Json(rows(&data, OfferingView::Full))).into_response(),
        Err(e) => ApiErrorType::from((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch offerings",
            Some(e.to_string()),
        ))
        .into_response(),
    }
}

/// GET /offerings/available?view=&min=
/// Returns offerings with at least `min` (default 1) free seats, projected
/// through `view`
pub async fn get_available_offerings(
    Query(query): Query<AvailableQuery>,
    State(s): State<Arc<AppState>>,
) -> Response {
    info!("GET /offerings/available {:?}", query);

    let view = match OfferingView::from_str(query.view.as_deref().unwrap_or("")) {
        Ok(view) => view,
        Err(e) => return ApiErrorType::from(e).into_response(),
    };

    match s.offerings.query_by_availability(query.min.unwrap_or(1)) {
        Ok(data) => (StatusCode::OK, Json(rows(&data, view))).into_response(),
        Err(e) => ApiErrorType::from(e).into_response(),
    }
}

/// GET /offerings/:code
/// Returns all sections of one subject
pub async fn get_offerings_by_code(
    Path(code): Path<String>,
    State(s): State<Arc<AppState>>,
) -> Response {
    info!("GET /offerings/{}", code);

    let code = match WatchCode::parse(&code) {
        Ok(code) => code,
        Err(e) => return ApiErrorType::from(e).into_response(),
    };

    match s.offerings.query_by_code(code.as_str()) {
        Ok(data) if data.is_empty() => ApiErrorType::from((
            StatusCode::NOT_FOUND,
            "Subject not in the listing",
            Some(code.to_string()),
        ))
        .into_response(),
        Ok(data) => (StatusCode::OK, Json(rows(&data, OfferingView::Full))).into_response(),
        Err(e) => ApiErrorType::from(e).into_response(),
    }
}
