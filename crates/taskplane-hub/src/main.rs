//! taskplane-hub — the hub daemon.
//!
//! Listens for units, probes each one that connects with an `init`
//! request, and logs lifecycle events. The transport and transaction
//! machinery in [`server`] is the real surface; this binary is a thin
//! shell over it.

mod server;

use anyhow::{Context, Result};
use clap::Parser;
use taskplane_core::wire::{HubToUnit, InitReq, hub_to_unit, unit_to_hub};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::{HubServer, ServerEvent};

/// taskplane hub daemon.
#[derive(Parser, Debug)]
#[command(name = "taskplane-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

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
    let hub = HubServer::bind(args.port)
        .await
        .with_context(|| format!("bind on port {} failed", args.port))?;

    let cancel = CancellationToken::new();
    tokio::task::spawn_local(hub.clone().run(cancel.clone()));

    let mut events = hub.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ServerEvent::UnitConnected(id)) => {
                    let Some(unit) = hub.unit(id) else { continue };
                    tokio::task::spawn_local(async move {
                        probe_unit(&unit, id).await;
                    });
                }
                Ok(ServerEvent::UnitDisconnected(id)) => {
                    info!("unit {id} left; {} still connected", hub.unit_count());
                }
                Err(err) => {
                    warn!("event stream lagged: {err}");
                }
            },
        }
    }

    cancel.cancel();
    Ok(())
}

/// Ask a freshly connected unit who it is.
async fn probe_unit(unit: &server::UnitConnection, id: u64) {
    let request = HubToUnit {
        req_id: 1,
        sub: Some(hub_to_unit::Sub::Init(InitReq {})),
    };
    match unit.transact(&request).await {
        Ok(reply) => match reply.sub {
            Some(unit_to_hub::Sub::Init(init)) => {
                info!(
                    "unit {id} at {}: mac {}, version {}",
                    unit.peer(),
                    init.mac_addr,
                    init.version
                );
            }
            other => warn!("unit {id} answered init with an unexpected payload: {other:?}"),
        },
        Err(err) => error!("init probe for unit {id} failed: {err}"),
    }
}
