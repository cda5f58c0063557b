//! # callrelay
//!
//! Signaling relay binary:
//! - WebSocket signaling endpoint (`/ws`)
//! - Plain-text status (`/`) and JSON stats (`/stats`)
//! - Background sweeper that expires unanswered call attempts
//!
//! Media never passes through this process; devices negotiate a direct
//! WebRTC session using the offers, answers and candidates it relays.

use callrelay_common::config::{LogConfig, RelayConfig};
use callrelay_signaling::{RelayState, build_router, lifecycle};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "callrelay", version, about = "Call-session signaling relay")]
struct Cli {
    /// Config file (defaults to ./callrelay.toml if present)
    #[arg(short, long, env = "CALLRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.log.json |= cli.log_json;

    init_tracing(&config.log);

    tracing::info!("Starting callrelay v{}", env!("CARGO_PKG_VERSION"));

    let state = RelayState::from_config(&config)?;
    if state.policy.caller_count() == 0 {
        tracing::warn!("Whitelist is empty; every call request will be denied");
    } else {
        tracing::info!(
            callers = state.policy.caller_count(),
            mirror = config.policy.mirror,
            "Whitelist loaded"
        );
    }
    tracing::info!(
        call_timeout_secs = config.relay.call_timeout_secs,
        require_call_record = config.relay.require_call_record,
        report_unknown_target = config.relay.report_unknown_target,
        "Relay settings"
    );

    // === Call attempt sweeper ===
    let sweeper = lifecycle::spawn_call_sweeper(state.clone());

    // === Signaling WebSocket + status ===
    let app = build_router(state).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    tracing::info!("Signaling relay listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("callrelay stopped");
    Ok(())
}

/// Initialize tracing (structured logging). `RUST_LOG` wins over the config filter.
fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
