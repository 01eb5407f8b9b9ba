use axum::Json;
use serde_json::{Value, json};

pub const SERVICE_NAME: &str = "Webhook Deploy Listener";

/// GET /health - fixed liveness payload
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
