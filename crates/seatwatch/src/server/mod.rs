use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::{OfferingStore, SubscriptionStore};
use crate::error::{Error, Result};
use crate::server::endpoints::{offerings, status, subscriptions};
use crate::supervisor::SupervisorStatus;

mod endpoints;
mod types;

/// Shared state for the read-only API.
pub struct AppState {
    pub offerings: Arc<OfferingStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub status: watch::Receiver<SupervisorStatus>,
}

/// Creates a router that can be used by `axum`.
///
/// # Parameters
/// - `app_state`: The app server state.
///
/// # Returns
/// The router.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let offering_router = Router::new()
        .route("/offerings", get(offerings::get_all_offerings))
        .route("/offerings/available", get(offerings::get_available_offerings))
        .route("/offerings/:code", get(offerings::get_offerings_by_code));

    Router::new()
        .route("/health", get(status::get_health))
        .route(
            "/subscriptions/:code/count",
            get(subscriptions::get_subscription_count),
        )
        .merge(offering_router)
        .with_state(app_state)
}

/// Binds the API listener. Called before any background task starts so a bad
/// address aborts startup cleanly.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let address = format!("{}:{}", config.address, config.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| Error::config(format!("cannot bind {address}: {e}")))?;
    info!("Listening on {address}");
    Ok(listener)
}
