use anyhow::Context;
use clap::Parser;
use extractq_server::server::config::{CliArgs, ServerConfig};
use extractq_server::server::service::RelayService;
use extractq_server::server::telemetry::init_telemetry;
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

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    log_startup_info(&listener, &config);

    let service = RelayService::new(&config).await?;
    let res = service.serve(listener, shutdown_signal()).await;
    service.shutdown().await;

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    res
}

fn log_startup_info(listener: &TcpListener, config: &ServerConfig) {
    let addr = listener
        .local_addr()
        .map_or_else(|_| config.listen_addr.clone(), |a| a.to_string());
    if cfg!(debug_assertions) {
        tracing::info!("Starting relay on {} with full config: {:#?}", addr, config);
    } else {
        tracing::info!(
            "Starting relay on {} caching to {} via {}",
            addr,
            config.cache_dir.display(),
            config.overpass_url
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
