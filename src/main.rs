// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! camrelay — cloud camera fleet to WebRTC SFU relay
//!
//! Usage:
//!   camrelay run   --config config.toml
//!   camrelay check --config config.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camrelay::api;
use camrelay::config::Config;
use camrelay::lifecycle::StreamSupervisor;
use camrelay::provider::{HttpControlPlane, OauthTokenSource};
use camrelay::queue::CommandQueue;
use camrelay::relay::RelayOrchestrator;
use camrelay::sfu::HostedSfuClient;

#[derive(Parser)]
#[command(name = "camrelay", about = "Cloud camera to WebRTC SFU relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay all configured cameras until interrupted.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate the configuration file and exit.
    Check {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => run(config).await,
        Command::Check { config } => check(config),
    };
    if let Err(e) = result {
        error!(error = %e, "camrelay exiting");
        std::process::exit(1);
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    info!(
        cameras = cfg.cameras.len(),
        qpm = cfg.relay.qpm,
        sfu = cfg.sfu.base_url,
        "Starting camrelay"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.relay.rpc_timeout_secs))
        .build()
        .context("building HTTP client")?;

    let tokens = Arc::new(OauthTokenSource::new(http.clone(), &cfg.provider));
    let provider = Arc::new(HttpControlPlane::new(http.clone(), &cfg.provider, tokens));
    let sfu = Arc::new(HostedSfuClient::new(http, &cfg.sfu));

    let queue = CommandQueue::new(cfg.relay.qpm, cfg.relay.rpc_timeout());
    queue.start();

    let supervisor = StreamSupervisor::new(queue.clone(), provider, cfg.relay.clone());
    let ids: Vec<String> = cfg.cameras.iter().map(|c| c.id.clone()).collect();
    supervisor.start_cameras(&ids);

    let orchestrator = RelayOrchestrator::new(
        supervisor.clone(),
        sfu,
        cfg.relay.clone(),
        cfg.sfu.ice_urls.clone(),
    );
    orchestrator.start();

    if cfg.api.enabled {
        let state = Arc::new(api::AppState { orchestrator: orchestrator.clone() });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down…"),
        Err(e) => error!(error = %e, "Signal error"),
    }

    orchestrator.stop().await;
    supervisor.stop().await;
    queue.stop().await;
    info!("Shutdown complete");
    Ok(())
}

fn check(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!("Configuration OK: {} cameras", cfg.cameras.len());
    for cam in &cfg.cameras {
        println!("  {} ({})", cam.id, cam.name);
    }
    Ok(())
}
