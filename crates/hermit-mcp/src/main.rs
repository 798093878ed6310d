//! Hermit MCP Server
//!
//! This binary serves one local workspace directory over MCP on stdio,
//! exposing `run_command`, `read_file`, `write_file`, `delete_file` and
//! `list_dir`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hermit::{HermitConfig, Workspace};
use hermit_mcp::HermitServer;
use rmcp::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Hermit MCP Server - shell and file tools for one workspace
#[derive(Parser, Debug)]
#[command(name = "hermit-mcp")]
#[command(about = "MCP server exposing a workspace's shell and files over stdio")]
struct Args {
    /// Directory to serve as the workspace
    #[arg(long, env = "HERMIT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Optional TOML configuration file
    #[arg(long, env = "HERMIT_CONFIG")]
    config: Option<PathBuf>,

    /// Only allow these binaries (glob patterns, repeatable)
    #[arg(long = "allow")]
    allowed_binaries: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Output to stderr so logs don't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = HermitConfig::load_or_default(args.config.as_deref())?;
    let root = std::fs::canonicalize(&args.root)
        .with_context(|| format!("workspace root {} is not accessible", args.root.display()))?;

    let mut workspace_config = config.workspace_config();
    if !args.allowed_binaries.is_empty() {
        workspace_config.allowed_binaries = Some(args.allowed_binaries);
    }
    let workspace = Workspace::local(root, workspace_config);

    tracing::info!(root = %workspace.root.display(), "Starting Hermit MCP server");
    let server = HermitServer::new(&config, workspace);

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Hermit MCP server running");

    service.waiting().await?;

    tracing::info!("Hermit MCP server shutting down");

    Ok(())
}
