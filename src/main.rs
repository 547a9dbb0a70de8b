//! Straylight binary: `start` runs the gateway, `status` inspects a
//! state directory.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use straylight::adapters::console::ConsoleAdapter;
use straylight::config::Config;
use straylight::http;
use straylight::jobs::JobStore;
use straylight::logging;
use straylight::runtime::Runtime;
use straylight::state::{EventJournal, StatePaths};

/// Conversational assistant gateway with a durable on-disk job fabric.
#[derive(Debug, Parser)]
#[command(name = "straylight", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway: HTTP API, worker pool, and dispatchers.
    Start {
        /// Override the HTTP listen port (`PORT`).
        #[arg(long)]
        port: Option<u16>,
        /// Override the state directory (`STATE_DIR`).
        #[arg(long)]
        state_dir: Option<std::path::PathBuf>,
    },
    /// Print queue counts for a state directory and exit.
    Status {
        /// Override the state directory (`STATE_DIR`).
        #[arg(long)]
        state_dir: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start { port, state_dir } => {
            let mut config = Config::from_env().context("configuration error")?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir;
            }
            run_server(config).await
        }
        Command::Status { state_dir } => {
            logging::init_cli();
            let mut config = Config::from_env().context("configuration error")?;
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir;
            }
            print_status(&config)
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let paths = StatePaths::new(config.state_dir.clone());
    let _logging_guard =
        logging::init_production(&paths.logs_dir).context("logging setup failed")?;

    info!(port = config.port, state_dir = %config.state_dir.display(), "straylight starting");

    let adapter = Arc::new(ConsoleAdapter::new());
    let runtime = Runtime::build(config.clone(), adapter, None)
        .context("runtime construction failed")?;
    runtime.start();

    let router = http::build_router(runtime.app_state());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "http listener ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    runtime.shutdown().await;
    info!("straylight stopped");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

fn print_status(config: &Config) -> anyhow::Result<()> {
    let paths = Arc::new(StatePaths::new(config.state_dir.clone()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    let jobs = JobStore::new(paths, journal);
    let counts = jobs.status_counts().context("cannot read job store")?;

    println!("state dir: {}", config.state_dir.display());
    println!("queued:     {}", counts.queued);
    println!("running:    {}", counts.running);
    println!("cancelling: {}", counts.cancelling);
    println!("succeeded:  {}", counts.succeeded);
    println!("failed:     {}", counts.failed);
    println!("cancelled:  {}", counts.cancelled);
    Ok(())
}
