#![forbid(unsafe_code)]

use anyhow::Result;
use huddle::auth::google::{CredentialVerifier, GoogleVerifier};
use huddle::config::Config;
use huddle::media::{MediaConfig, MediaEngine, SfuEngine};
use huddle::metrics::ServerMetrics;
use huddle::room::registry::RegistrySettings;
use huddle::room::RoomRegistry;
use huddle::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - Starting server");

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);

    let engine = SfuEngine::new(MediaConfig::from_config(&config)).await?;
    let engine: Arc<dyn MediaEngine> = Arc::new(engine);
    info!("Media engine started with {} workers", config.num_workers);

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(
        engine,
        metrics.clone(),
        RegistrySettings::from_config(&config),
    ));

    let verifier = config.google_client_id.clone().map(|client_id| {
        let verifier: Arc<dyn CredentialVerifier> =
            Arc::new(GoogleVerifier::new(client_id, config.google_tokeninfo_url.clone()));
        verifier
    });

    let port = config.port;
    let signaling_server = SignalingServer::new(config, Arc::clone(&registry), metrics, verifier);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
