//! gateway-core CLI entry point.
//!
//! Loads a YAML config (`--config`/`GATEWAY_CONFIG`, default
//! `config.yaml`), starts every configured gateway instance, the
//! registry heartbeat sweeper, and (if `admin_bind` is set) the admin
//! REST surface, then waits for a shutdown signal and drains gracefully
//! (§4.8, §6 CLI/env).

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gateway_core::admin::AppState;
use gateway_core::{Config, Gateway, VERSION};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the registry sweeper checks temp-instance heartbeats (§4.6).
const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "gateway-core")]
#[command(version = VERSION)]
#[command(about = "Multi-tenant API gateway with an embedded reverse-tunneling subsystem")]
struct Args {
    /// Path to the YAML config file.
    #[arg(short = 'c', long = "config", env = "GATEWAY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Runtime profile name (selects nothing in this build beyond being
    /// logged; surfaced for operators driving per-environment configs).
    #[arg(short = 'p', long = "profile", env = "GATEWAY_PROFILE", default_value = "default")]
    profile: String,

    /// Overrides the config's `log_level` if set.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Validate the config and exit without starting any listener.
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .thread_name("gateway-worker")
        .build()?;

    match runtime.block_on(async_main()) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "gateway-core exited with an error");
            std::process::exit(1);
        }
    }
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load_async(&args.config).await?;
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_env("GATEWAY_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    info!(version = VERSION, profile = %args.profile, config = %args.config.display(), "starting gateway-core");

    if args.test {
        info!("configuration is valid");
        return Ok(());
    }

    let admin_bind = config.admin_bind;
    let gateway = Arc::new(Gateway::new(config).await?);
    gateway.start_instances().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn(
        gateway
            .registry
            .clone()
            .run_sweeper(REGISTRY_SWEEP_INTERVAL, shutdown_tx.subscribe()),
    );

    if let Some(addr) = admin_bind {
        let state = AppState::new(String::new(), gateway.clone());
        tokio::spawn(async move {
            if let Err(e) = gateway_core::admin::start_server(state, addr).await {
                error!(%e, "admin API server exited");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining instances");
    let _ = shutdown_tx.send(());

    for id in gateway.instances.list_ids().await {
        if let Some(instance) = gateway.instances.get(&id).await {
            if let Err(e) = instance.stop(std::future::ready(())).await {
                error!(id = %id, %e, "error stopping gateway instance");
            }
        }
    }

    info!("gateway-core shut down cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
