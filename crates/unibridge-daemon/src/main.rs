//! Unibridge daemon entry point.
//!
//! Binds the `WebSocket` listener, wires the session registry and
//! connection hub together, and runs until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unibridge_hub::{AuthGate, ConnectionHub, HubConfig, SessionRegistry};

#[derive(Debug, Parser)]
#[command(
    name = "unibridged",
    about = "Bridge daemon connecting AI agents to running Unity Editors",
    version
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "UNIBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override (e.g. 127.0.0.1:8090).
    #[arg(long)]
    listen: Option<String>,

    /// Run in remote-hosted (multi-tenant) mode: require API keys and
    /// scope every lookup by user.
    #[arg(long)]
    remote_hosted: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "UNIBRIDGE_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve the effective configuration: file (when given), then CLI
/// overrides, then validation.
fn load_config(args: &Args) -> anyhow::Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HubConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen_addr = Some(listen.clone());
    }
    if args.remote_hosted {
        config.remote_hosted = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    let registry = Arc::new(SessionRegistry::new(config.remote_hosted));
    let mut hub = ConnectionHub::new(config.clone(), Arc::clone(&registry));
    if config.remote_hosted {
        hub = hub.with_auth(AuthGate::new(&config.auth).context("building auth gate")?);
    }
    let hub = Arc::new(hub);

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    info!(
        addr = %listener.local_addr()?,
        remote_hosted = config.remote_hosted,
        "Unibridge daemon starting"
    );

    let serve = tokio::spawn(Arc::clone(&hub).serve(listener));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    hub.shutdown();
    serve.await??;

    let status = hub.status();
    info!(sessions = status.sessions, uptime_secs = status.uptime_secs, "Daemon stopped");
    Ok(())
}
