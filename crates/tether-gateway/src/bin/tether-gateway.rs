//! Tether Gateway Binary
//!
//! Standalone control-plane gateway for remote nodes and agent sessions.
//!
//! # Usage
//! ```bash
//! tether-gateway [--config tether.toml] [--port 18789] [--host 127.0.0.1] [--verbose]
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_gateway::{GatewayConfig, GatewayServer};
use tracing_subscriber::EnvFilter;

/// Tether Gateway - node registry, command routing and session pruning
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (JSON, or TOML by extension)
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "TETHER_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "TETHER_HOST")]
    host: Option<String>,

    /// Maximum concurrent links
    #[arg(long)]
    max_connections: Option<usize>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env is fine
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(args.verbose)
        .init();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(max) = args.max_connections {
        config = config.with_max_connections(max);
    }

    print_banner(&config);

    let gateway = Arc::new(GatewayServer::new(config).context("invalid gateway configuration")?);
    let listener = gateway.bind().await?;

    let server = gateway.clone();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    gateway.shutdown().await;
    serving.await??;

    Ok(())
}

fn print_banner(config: &GatewayConfig) {
    println!();
    println!("Tether Gateway v{}", tether_gateway::VERSION);
    println!();
    println!("WebSocket");
    println!("   └─ ws://{}:{}/ws?principal=<name>", config.host, config.port);
    println!();
    println!("HTTP Endpoints");
    println!("   ├─ GET  /health   — Health check");
    println!("   └─ GET  /status   — Links, nodes, sessions, commands");
    println!();
    println!(
        "Pruning: {:?}, budget {} / target {} tokens",
        config.pruning.strategy, config.session.token_budget, config.session.target_tokens
    );
    println!();
    println!("Press Ctrl+C to stop the gateway");
    println!();
}
