mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use botfarm_runtime::runtime::{build_router, ApiState, ResourceAllocator, SharedResourceRepository};
use botfarm_runtime::{SharedClock, TokenSigner};
use clap::Parser;
use config::{CliArgs, ServerConfig};
use telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry(config.log_format)?;

    let repository = config.storage.open()?;
    let state = ApiState::new(
        repository,
        config.lease.clone(),
        TokenSigner::new(config.auth_secret.clone())?,
        config.token_ttl,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper = config.reap_interval.map(|every| {
        tokio::spawn(run_reaper(
            state.allocator().clone(),
            state.clock().clone(),
            every,
            stop_rx,
        ))
    });

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    if let Some(reaper) = reaper {
        if let Err(e) = reaper.await {
            tracing::error!(error = %e, "background reaper did not stop cleanly");
        }
    }

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting botfarm service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting botfarm service on {} with {} storage",
            config.server_addr,
            config.storage.backend
        );
    }
}

/// Periodically clears stale leases until `stop` flips. Failures are logged
/// and the loop keeps going.
async fn run_reaper(
    allocator: Arc<ResourceAllocator<SharedResourceRepository>>,
    clock: SharedClock,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = stop.changed() => break,
        }

        let allocator = allocator.clone();
        let now = clock.now();
        match tokio::task::spawn_blocking(move || allocator.reaper().reap(now)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "background reap failed"),
            Err(e) => tracing::error!(error = %e, "background reap task panicked"),
        }
    }
    tracing::debug!("background reaper stopped");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
