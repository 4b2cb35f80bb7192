use clap::Parser;
use gapless::{Coordinator, InMemoryStore};
use gapless_node::server::{
    config::{CliArgs, ServerConfig},
    heartbeat::{SERVICE_NAME, heartbeat_loop},
    telemetry::{TelemetryProviders, init_telemetry},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::{ServingStatus, server::HealthReporter};

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

    // The embedded store only coordinates instances inside this process.
    let store = Arc::new(InMemoryStore::new());
    let coordinator = Arc::new(Coordinator::start(store, config.coordinator()).await?);

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status(SERVICE_NAME, ServingStatus::Serving)
        .await;

    let heartbeat_token = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        coordinator,
        health_reporter.clone(),
        config.heartbeat_interval,
        heartbeat_token.clone(),
    ));

    let tcp = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    Server::builder()
        .add_service(health_service)
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(tcp),
            shutdown_signal(health_reporter, heartbeat_token, providers),
        )
        .await?;

    if let Err(_e) = heartbeat.await {
        #[cfg(feature = "tracing")]
        tracing::error!("Heartbeat task failed: {_e}");
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Node shut down successfully");
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting node {} on {} with full config: {:#?}",
            _config.node_id,
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting node {} on {}",
            _config.node_id,
            _config.server_addr
        );
    }
}

async fn shutdown_signal(
    health_reporter: HealthReporter,
    heartbeat_token: CancellationToken,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
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

    // 1. Publish the status and stop heartbeating
    heartbeat_token.cancel();
    health_reporter
        .set_service_status(SERVICE_NAME, ServingStatus::NotServing)
        .await;

    // 2. Flush exporters
    providers.shutdown();
}
