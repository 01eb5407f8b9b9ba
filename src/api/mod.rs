//! HTTP handlers for the listener

pub mod health;
pub mod webhook;

pub use health::health;
pub use webhook::handle_webhook;

use crate::error::WebhookError;

/// Fallback for unknown paths and methods
pub async fn not_found() -> WebhookError {
    WebhookError::NotFound
}
