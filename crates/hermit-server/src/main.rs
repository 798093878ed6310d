//! Hermit HTTP server
//!
//! Serves the workspace API on a TCP address until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hermit::{Hermit, HermitConfig, InMemoryStore, TokenAuthenticator};
use hermit_server::{AppState, decider, router, shutdown_signal};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Hermit HTTP server - workspace sandboxes over HTTP and SSE
#[derive(Parser, Debug)]
#[command(name = "hermit-server")]
#[command(about = "Serve Hermit workspaces over HTTP with Server-Sent-Events streaming")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "HERMIT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long, env = "HERMIT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Directory holding workspace roots (overrides the config file)
    #[arg(long, env = "HERMIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Accept a bearer token for a principal, as `token=principal` (repeatable)
    #[arg(long = "token", value_parser = parse_token)]
    tokens: Vec<(String, String)>,
}

fn parse_token(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((token, principal)) if !token.is_empty() && !principal.is_empty() => {
            Ok((token.to_string(), principal.to_string()))
        }
        _ => Err("expected token=principal".to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = HermitConfig::load_or_default(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.sandbox.data_dir = data_dir;
    }
    config.server.tokens.extend(args.tokens);
    if config.server.tokens.is_empty() {
        tracing::warn!("no bearer tokens configured; every request will be rejected");
    }

    std::fs::create_dir_all(&config.sandbox.data_dir).with_context(|| {
        format!(
            "cannot create data directory {}",
            config.sandbox.data_dir.display()
        )
    })?;

    let hermit = Hermit::new(&config, Arc::new(InMemoryStore::new()), decider(&config));
    let auth = TokenAuthenticator::new(config.server.tokens.clone());
    let app = router(AppState::new(Arc::new(hermit), Arc::new(auth)));

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    tracing::info!(
        addr = %config.server.listen,
        data_dir = %config.sandbox.data_dir.display(),
        "Starting Hermit HTTP server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Hermit HTTP server shut down");
    Ok(())
}
