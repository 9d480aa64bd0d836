//! protomux
//!
//! Serves several unrelated protocols on one port by running every
//! configured protocol handler against each connection until one claims it.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────┐
//!                   │                  PROTOMUX                     │
//!                   │                                               │
//!   Client ─────────┼─▶ Listener ─▶ RemoteConnection                │
//!                   │                  │  read fan-out              │
//!                   │                  │  write reconciliation      │
//!                   │                  ├─▶ Connection ─▶ protocol 1 │
//!                   │                  ├─▶ Connection ─▶ protocol 2 │
//!                   │                  └─▶ Connection ─▶ protocol N │
//!                   │                                               │
//!                   │  config · framework · lifecycle · observability│
//!                   └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use protomux::config::load_configs;
use protomux::engine::Engine;
use protomux::framework::ProtocolRegistry;
use protomux::lifecycle::wait_for_termination;
use protomux::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "protomux")]
#[command(about = "Serve several protocols on one port", long_about = None)]
struct Cli {
    /// Configuration file; repeat to merge several.
    #[arg(short = 'c', long = "config-file", required = true)]
    config_files: Vec<PathBuf>,

    /// Log level, overriding the configuration (RUST_LOG wins over both).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and build the engine, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("protomux: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_configs(cli.config_files.as_slice())?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_logging(Some(level));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        services = config.services.len(),
        "protomux starting"
    );

    let registry = ProtocolRegistry::with_builtin();
    let mut engine = Engine::create(&config, &registry).await?;

    if cli.check {
        tracing::info!(listeners = engine.local_addrs().len(), "Configuration OK");
        println!("configuration OK");
        return Ok(());
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    engine.start();
    for addr in engine.local_addrs() {
        tracing::info!(address = %addr, "Listening for connections");
    }

    wait_for_termination().await;

    engine.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
