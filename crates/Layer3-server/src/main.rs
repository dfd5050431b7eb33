//! Harbor server - main entry point

mod api;
mod app;

use anyhow::Context;
use clap::{Parser, Subcommand};
use harbor_foundation::HarborConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Harbor - task engine for a single-host container console
#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Number of task workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Root directory for database, logs and artifacts
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Container engine address (unix:// or tcp://)
    #[arg(long)]
    docker_host: Option<String>,

    /// Proxy for git, compose and URL downloads (http, https, socks5, socks5h)
    #[arg(long)]
    proxy_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the worker pool (default)
    Serve,
    /// Validate configuration and reach the container engine, then exit
    Check,
}

impl Args {
    fn apply(&self, config: &mut HarborConfig) {
        if let Some(bind) = &self.bind {
            config.bind = Some(bind.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(host) = &self.docker_host {
            config.docker_host = Some(host.clone());
        }
        if let Some(proxy) = &self.proxy_url {
            config.proxy_url = Some(proxy.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = HarborConfig::load().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Check => check(&config).await,
        Command::Serve => serve(config).await,
    }
}

async fn check(config: &HarborConfig) -> anyhow::Result<()> {
    let runtime = harbor_task::DockerRuntime::connect(config.docker_host.as_deref())?;
    runtime
        .ping()
        .await
        .context("Container engine is not reachable")?;
    let registry = app::build_registry(config)?;
    let proxy = app::proxy(config)?;

    println!("config:    ok");
    println!("engine:    ok");
    println!("handlers:  {} registered", registry.len());
    match proxy {
        Some(proxy) => println!("proxy:     {}", proxy),
        None => println!("proxy:     none"),
    }
    println!("data dir:  {}", config.data_dir().display());
    Ok(())
}

async fn serve(config: HarborConfig) -> anyhow::Result<()> {
    let app = app::start(&config).await?;
    let state = api::AppState {
        service: app.service.clone(),
        actor_header: config.actor_header(),
    };

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(bind = %bind, workers = config.workers(), "Harbor listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Stopping workers");
    app.scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
