use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use fleet::{
    config::{Config, WORKER_CONFIG_ENV, WORKER_ID_ENV},
    dispatch::{Dispatcher, route_inbound},
    load_balancer::LoadBalancer,
    logging, node, pool,
    server::Server,
    worker::WorkerId,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, instrument};

#[derive(Parser)]
#[command(version, about = "Multi-process HTTP load balancer", long_about = None)]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long, default_value = "./config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Workers are started with their configuration in the environment.
    let result = match std::env::var(WORKER_CONFIG_ENV) {
        Ok(raw) => run_worker(&raw).await,
        Err(_) => run_master(Cli::parse()).await,
    };

    if let Err(e) = result {
        eprintln!("fleet: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_worker(raw_config: &str) -> Result<()> {
    let config = Config::from_env_value(raw_config).context("decoding worker configuration")?;
    init_logging(&config.server.log_level)?;

    let id = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(WorkerId)
        .context("worker id missing from environment")?;

    node::run(id, config).await
}

async fn run_master(cli: Cli) -> Result<()> {
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.server.log_level)?;

    let span = info_span!("fleet_startup");
    let enter = span.enter();

    info!("Master process is on");
    let worker_count = config.worker_count();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let workers = pool::spawn_workers(&config, worker_count, inbound_tx)?;

    let load_balancer = Arc::new(LoadBalancer::new(workers.handles()));
    tokio::spawn(route_inbound(inbound_rx, load_balancer.clone()));

    let dispatcher = Dispatcher::from_config(load_balancer, &config);
    let server_addr = SocketAddr::from(([0, 0, 0, 0], config.server.listen));
    let server = Server::new(server_addr, dispatcher)
        .await
        .with_context(|| format!("binding {}", server_addr))?;

    info!(
        "Listening on {} with {} workers ({})",
        server_addr, worker_count, config.server.algorithm
    );

    drop(enter);
    drop(span);

    tokio::select! {
        _ = run_server(server) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    workers.shutdown().await;
    Ok(())
}

#[instrument(skip(server))]
async fn run_server(server: Server) {
    loop {
        match server.accept().await {
            Ok(_) => debug!("Accepted new connection"),
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

fn init_logging(default_level: &str) -> Result<()> {
    logging::init_logging(default_level)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}
