//! Webhook handler for GitHub push events

use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, Request, State as AxumState},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::error::WebhookError;
use crate::filter::{Decision, should_deploy};
use crate::runner::{ExecutionError, run_deployment};
use crate::signature::verify_signature;
use crate::webhook::PushEvent;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Handles the GitHub webhook POST request.
///
/// Runs the deployment inline: the delivery stays open until the script
/// finishes or times out, and the response reports the outcome.
pub async fn handle_webhook(AxumState(state): AxumState<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let client = client_address(&parts);

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(client = %client, "Could not read webhook body: {}", e);
            return WebhookError::InvalidPayload.into_response();
        }
    };

    match dispatch(&state, &parts.headers, &body, &client).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(
    state: &SharedState,
    headers: &HeaderMap,
    body: &Bytes,
    client: &str,
) -> Result<Response, WebhookError> {
    if body.is_empty() {
        warn!(client = %client, "Rejected webhook without content");
        return Err(WebhookError::EmptyBody);
    }

    let signature = header_str(headers, SIGNATURE_HEADER);
    if !verify_signature(state.config.signing_secret(), body, signature) {
        warn!(client = %client, "Invalid signature from {}", client);
        return Err(WebhookError::Unauthorized);
    }

    let payload: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        error!(client = %client, "Invalid JSON payload: {}", e);
        WebhookError::InvalidPayload
    })?;

    let event_type = header_str(headers, EVENT_HEADER);
    let branch = match should_deploy(event_type, &payload, &state.config.allowed_branches) {
        Decision::Proceed { branch } => branch,
        Decision::IgnoredWrongEvent { event } => {
            info!(event = %event, "Ignoring {} event", event);
            return Ok(ignored(format!("Not a push event: {}", event)));
        }
        Decision::IgnoredWrongBranch { branch } => {
            info!(branch = %branch, "Ignoring push to branch: {}", branch);
            return Ok(ignored(format!("Branch not allowed: {}", branch)));
        }
    };

    let event = PushEvent::from_value(payload).map_err(|e| {
        error!("Error processing webhook: {}", e);
        WebhookError::Internal(e.to_string())
    })?;
    let commit = event.short_commit_id();

    info!(
        branch = %branch,
        commit = %commit,
        author = %event.author_name(),
        message = %event.commit_message(),
        "Deployment triggered by push to {}",
        branch
    );

    let succeeded = deploy(state, &branch, &commit).await;
    Ok(deployment_response(succeeded, &branch, &commit))
}

/// Runs the script under the deployment lock and logs the outcome.
async fn deploy(state: &SharedState, branch: &str, commit: &str) -> bool {
    let _guard = match state.deploy_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            info!(
                branch = %branch,
                commit = %commit,
                "Another deployment is running, waiting for it to finish"
            );
            state.deploy_lock.lock().await
        }
    };

    let script = &state.config.deploy_script;
    match run_deployment(script, state.config.deploy_timeout()).await {
        Ok(outcome) if outcome.success => {
            info!(
                deployment_id = %outcome.id,
                branch = %branch,
                commit = %commit,
                started_at = %outcome.started_at.to_rfc3339(),
                duration_ms = outcome.duration.as_millis() as u64,
                "Deployment completed successfully"
            );
            if !outcome.stdout.is_empty() {
                info!(deployment_id = %outcome.id, "Script output: {}", outcome.stdout);
            }
            true
        }
        Ok(outcome) => {
            error!(
                deployment_id = %outcome.id,
                branch = %branch,
                commit = %commit,
                exit_code = ?outcome.exit_code(),
                started_at = %outcome.started_at.to_rfc3339(),
                duration_ms = outcome.duration.as_millis() as u64,
                "Deployment failed with {:?}",
                outcome.exit
            );
            if !outcome.stderr.is_empty() {
                error!(deployment_id = %outcome.id, "Script error: {}", outcome.stderr);
            }
            false
        }
        Err(e) => {
            error!(branch = %branch, commit = %commit, "Deployment failed: {}", e);
            if let ExecutionError::Timeout { stdout, stderr, .. } = &e {
                if !stdout.is_empty() {
                    info!("Script output before timeout: {}", stdout);
                }
                if !stderr.is_empty() {
                    error!("Script error before timeout: {}", stderr);
                }
            }
            false
        }
    }
}

fn ignored(reason: String) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ignored",
            "reason": reason,
        })),
    )
        .into_response()
}

fn deployment_response(succeeded: bool, branch: &str, commit: &str) -> Response {
    if succeeded {
        (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Deployment triggered successfully",
                "branch": branch,
                "commit": commit,
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "message": "Deployment failed",
                "branch": branch,
                "commit": commit,
            })),
        )
            .into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Peer address when the server was started with connect info
fn client_address(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
