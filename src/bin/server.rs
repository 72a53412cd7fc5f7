//! HTTP Tunnel Server
//!
//! Serves the tunnel endpoint over plain HTTP:
//! - Starts one tunnel engine per session on request
//! - Exchanges sequenced message batches with clients
//! - Tears sessions down on request

use anyhow::{Context, Result};
use clap::Parser;
use http_tunnel::{config::generate_example_config, transport::TunnelRouter, Config};
use std::future::IntoFuture;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// HTTP Tunnel Server - TCP connections driven over HTTP requests
#[derive(Parser, Debug)]
#[command(name = "http-tunnel-server")]
#[command(about = "HTTP Tunnel Server - TCP connections driven over HTTP requests")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        print!("{}", example);
        return Ok(());
    }

    let (config, loaded) = if Path::new(&args.config).exists() {
        let config = Config::load(&args.config).context("Failed to load configuration")?;
        (config, true)
    } else {
        (Config::default(), false)
    };

    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    if !loaded {
        warn!("Config file {} not found, using defaults", args.config);
    }

    let listen_addr = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let app = TunnelRouter::from_config(&config).build(&config.server.path);

    info!("HTTP Tunnel Server v{}", http_tunnel::VERSION);
    info!("Listening on {}{}/{{session}}", listen_addr, config.server.path.trim_end_matches('/'));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    // Start requests stay open for the life of their engine, so shutdown
    // drops the server instead of draining it
    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("Server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Install the global subscriber
fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}
