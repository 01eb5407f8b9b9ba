use deploy_listener::error::ListenerError;
use deploy_listener::logging::setup_logging;
use deploy_listener::{AppState, ListenerConfig, build_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ListenerConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Keep the guard alive so buffered lines reach the log file
    let _log_guard = match setup_logging(config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("Error running webhook listener: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: ListenerConfig) -> Result<(), ListenerError> {
    if let Some(expected) = &config.expected_user {
        check_user(expected);
    }

    if !config.deploy_script.exists() {
        error!(
            "Deployment script not found: {}",
            config.deploy_script.display()
        );
        error!("Please ensure the deployment script is in place before starting the webhook listener");
        return Err(ListenerError::MissingExecutable(config.deploy_script));
    }

    if config.signing_secret().is_none() {
        warn!("Unsigned webhooks are allowed - any client that can reach this port can trigger a deployment");
    }

    let bind_address = config.bind_address();
    info!("Webhook listener starting...");
    info!("   Port: {}", config.port);
    info!("   Deployment script: {}", config.deploy_script.display());
    info!("   Allowed branches: {}", config.allowed_branches.join(", "));
    info!("   Deployment timeout: {}s", config.deploy_timeout_secs);
    info!("   Health check: http://localhost:{}/health", config.port);

    let state = Arc::new(AppState::new(config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Webhook listener stopped");
    Ok(())
}

#[cfg(unix)]
fn check_user(expected: &str) {
    use nix::unistd::{Uid, User};

    let uid = Uid::effective();
    if uid.is_root() {
        return;
    }
    match User::from_uid(uid) {
        Ok(Some(user)) if user.name != expected => {
            warn!(
                "Not running as {} user (current: {})",
                expected, user.name
            );
        }
        Ok(Some(_)) => {}
        Ok(None) => warn!("Could not resolve user name for uid {}", uid),
        Err(e) => warn!("Could not look up current user: {}", e),
    }
}

#[cfg(not(unix))]
fn check_user(_expected: &str) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Webhook listener stopped by user"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
