use std::sync::Arc;

use clap::Parser;
use event_bus::{EventBus, EventKind};
use gateway::state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP/WebSocket gateway for developing MicroPython devices over serial.
#[derive(Debug, Parser)]
struct Args {
    /// Override the configured host to bind.
    #[arg(long)]
    host: Option<String>,
    /// Override the configured port to bind.
    #[arg(long)]
    port: Option<u16>,
    /// Path to the persisted config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(gateway::config::default_config_path);
    let mut config = gateway::config::load(&config_path);
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }

    let bus = Arc::new(EventBus::new());
    bus.start();

    let state = AppState::new(Arc::clone(&bus), config.clone(), config_path);

    let watcher = port_discovery::watch(Arc::clone(&bus), port_discovery::DEFAULT_POLL_INTERVAL);
    *state.port_watcher.write().await = Some(watcher);

    // A removed port's session is no longer reachable; disconnect it and
    // drop it from the registry so it doesn't linger as a phantom device.
    // `Session::disconnect` already emits `DEVICE_DISCONNECTED` once, so this
    // handler must not emit a second one (testable property 10).
    let disconnect_state = Arc::clone(&state);
    bus.subscribe(EventKind::PortRemoved, move |event| {
        let Some(port_id) = event.source.clone() else { return };
        let state = Arc::clone(&disconnect_state);
        tokio::spawn(async move {
            if let Some(session) = state.remove_session(&port_id).await {
                session.disconnect().await;
            }
        });
    });

    let router = gateway::build_router(Arc::clone(&state));
    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind_addr}: {e}"));
    info!(addr = %bind_addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C, then runs the ordered shutdown sequence
/// before letting `axum::serve` return.
async fn shutdown_signal(state: Arc<AppState>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    gateway::shutdown::run(state).await;
}
