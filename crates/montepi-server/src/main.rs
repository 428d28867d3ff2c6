#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use montepi::{CalculationService, WorkerPool};
use server::config::{CliArgs, ServerConfig};
use server::http::{AppState, router};
use server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let service = match &config.database_url {
        Some(url) => CalculationService::connect_sqlite(url, config.engine.clone()).await?,
        None => CalculationService::in_memory(config.engine.clone()),
    };

    let pool = config
        .role
        .runs_workers()
        .then(|| service.spawn_workers(config.num_workers));

    let result = if config.role.serves_http() {
        serve_http(&config, service).await
    } else {
        log_startup_info("the job queue (no HTTP)", &config);
        shutdown_signal().await;
        Ok(())
    };

    if let Some(pool) = pool {
        stop_workers(pool).await;
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    providers.shutdown();
    result
}

async fn serve_http(config: &ServerConfig, service: CalculationService) -> anyhow::Result<()> {
    let state = AppState::new(service);
    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, config);

    let streams = state.streams.clone();
    let grace = config.engine.shutdown_timeout;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            streams.shutdown(grace).await;
        })
        .await?;
    Ok(())
}

async fn stop_workers(pool: WorkerPool) {
    if let Err(_e) = pool.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during worker shutdown: {:?}", _e);
    }
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting montepi on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting montepi on {} as {} with {} workers",
            _addr,
            _config.role,
            _config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("failed to install SIGTERM handler: {_e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("failed to install Ctrl+C handler: {_e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
