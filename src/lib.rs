pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod runner;
pub mod signature;
pub mod webhook;

use axum::{Router, routing};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use config::ListenerConfig;

pub struct AppState {
    pub config: ListenerConfig,
    /// Held for the whole run of the deployment script. Deliveries that
    /// qualify while it is taken wait their turn.
    pub deploy_lock: Mutex<()>,
}

impl AppState {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            deploy_lock: Mutex::new(()),
        }
    }
}

pub type SharedState = Arc<AppState>;

/// `POST /webhook` and `GET /health`; every other path or method is a 404.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/webhook",
            routing::post(api::handle_webhook).fallback(api::not_found),
        )
        .route(
            "/health",
            routing::get(api::health).fallback(api::not_found),
        )
        .fallback(api::not_found)
        .with_state(state)
}
