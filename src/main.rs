use hibergate::config::Config;
use hibergate::engine::Engine;
use hibergate::gateway::Gateway;
use hibergate::scale::{ApiServerClient, SharedScaleClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hibergate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hibergate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        instances = config.instances.len(),
        "Configuration loaded"
    );

    // Talk to the API server we are running inside of
    let client: SharedScaleClient = Arc::new(ApiServerClient::in_cluster().map_err(|e| {
        error!(error = %e, "Failed to set up API server client");
        e
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Assemble every instance and register it with the shared gateway
    let gateway = Arc::new(Gateway::new());
    let mut engines = Vec::new();
    for instance in config.instances {
        let name = instance.name.clone();
        let engine = Engine::new(instance, Arc::clone(&client), &gateway).map_err(|e| {
            error!(instance = %name, error = %e, "Failed to assemble instance");
            e
        })?;
        engines.push(engine);
    }

    // Bind all registered ports, then start the controllers
    gateway.start(shutdown_rx.clone()).await?;
    for engine in engines {
        tokio::spawn(engine.run());
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown to the gateway listeners
    let _ = shutdown_tx.send(true);

    info!("Shutdown complete");
    Ok(())
}
