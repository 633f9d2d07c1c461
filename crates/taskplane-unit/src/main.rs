//! taskplane-unit — the unit daemon.
//!
//! Connects to the hub once at startup, bootstraps the work directory,
//! then serves requests until the hub disconnects or a signal asks for
//! shutdown. Losing the connection is terminal: the process tears its
//! state down and exits rather than reconnecting.
//!
//! Everything runs on one current-thread runtime with a `LocalSet`; the
//! subsystems are deliberately `!Send`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use taskplane_unit::client::UnitClient;
use taskplane_unit::dispatch;
use taskplane_unit::state::UnitState;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// taskplane unit daemon.
#[derive(Parser, Debug)]
#[command(name = "taskplane-unit")]
#[command(version, about, long_about = None)]
struct Args {
    /// Hub port to connect to.
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Hub address to connect to.
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Work directory holding the folders.
    #[arg(short, long, default_value = "./_work")]
    workdir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(args)))
}

async fn run(args: Args) -> Result<()> {
    let state = UnitState::new(args.workdir.clone());
    state
        .bootstrap()
        .await
        .with_context(|| format!("workdir init failed: {}", args.workdir.display()))?;

    let client = UnitClient::connect(&args.address, args.port)
        .await
        .with_context(|| format!("connect to {}:{} failed", args.address, args.port))?;

    info!(
        "unit started: hub {}:{}, workdir {}",
        args.address,
        args.port,
        args.workdir.display()
    );

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        result = dispatch::run(state.clone(), client) => match result {
            Ok(()) => info!("connection closed"),
            // The connection is gone either way; shut down cleanly and
            // leave exit codes to startup failures.
            Err(err) => error!("connection lost: {err}"),
        },
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    state.shutdown().await;
    info!("unit stopped");
    Ok(())
}
