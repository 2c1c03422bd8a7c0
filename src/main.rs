mod backend;
mod config;
mod connect;
mod http;
mod metrics;
mod model;
mod poll;
mod session;

use axum::serve;
use backend::HttpBackend;
use clap::Parser;
use config::Config;
use connect::ConnectionManager;
use metrics::Metrics;
use poll::MetricsPoller;
use session::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        poll_interval_secs = cfg.poll_interval_secs,
        backend = %cfg.backend.base_url,
        "starting fleetmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let backend = match HttpBackend::new(&cfg.backend) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            error!(error = %err, "failed to build backend client");
            std::process::exit(1);
        }
    };

    let registry = SessionRegistry::new();
    let poller = MetricsPoller::new(
        backend.clone(),
        registry.clone(),
        metrics.clone(),
        Duration::from_secs(cfg.poll_interval_secs),
    );
    let manager = Arc::new(ConnectionManager::new(
        backend,
        registry,
        poller,
        metrics.clone(),
        cfg.defaults.ssh_user.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Follow every connected host's published states and log transitions.
    let watch_task = {
        let manager = manager.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut connected_rx = manager.subscribe_connected();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = connected_rx.recv() => {
                        match event {
                            Ok(host) => {
                                if let Some(subscription) = manager.poller().subscribe(&host) {
                                    tokio::spawn(log_poll_states(subscription));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "connected-host notifications lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    };

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let manager = manager.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, manager);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = watch_task.await;
    let _ = http_task.await;
}

async fn log_poll_states(mut subscription: poll::Subscription) {
    while let Ok(state) = subscription.changed().await {
        match state {
            poll::PollState::Snapshot(snapshot) => {
                debug!(
                    host = %snapshot.host,
                    cpu = snapshot.cpu_percent,
                    mem = snapshot.mem_percent,
                    "metrics updated"
                );
            }
            poll::PollState::Error(err) => {
                warn!(host = %subscription.host(), error = %err, "poll failed");
            }
            poll::PollState::Pending => {}
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
