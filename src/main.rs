//! stdio-gateway
//!
//! Serves a set of stdio JSON-RPC tool servers behind one streaming HTTP
//! endpoint.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use stdio_gateway::config::load_config;
use stdio_gateway::LogOptions;

/// Aggregating HTTP gateway for stdio JSON-RPC tool servers
#[derive(Parser, Debug)]
#[command(name = "stdio-gateway", version)]
#[command(about = "Aggregating HTTP gateway for stdio JSON-RPC tool servers", long_about = None)]
struct Args {
    /// Provider configuration file (JSON, or YAML by extension)
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "mcp-servers.json")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long, env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Listen port, overrides the config file
    #[arg(short, long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    stdio_gateway::init_tracing(&LogOptions {
        json: args.log_json,
        file: args.log_file.clone(),
    })?;

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %args.config.display(), error = %e, "failed to load config");
            return Err(e).context("configuration load failed");
        }
    };
    if let Some(host) = args.host {
        config.gateway.host = host;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    stdio_gateway::serve(config).await
}
