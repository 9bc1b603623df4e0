//! Consent Server - Main entry point

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;

use consent_core::{
    api::{self, AppState},
    config::Config,
    consent_store::InMemoryConsentStore,
    crypto::{CryptoProvider, LocalCryptoProvider},
    events::InMemoryEventStore,
    facts::FhirConsentFactBuilder,
    registry::InMemoryRegistry,
    sagas::InMemoryUniquenessProjection,
    service::{Collaborators, ConsentService},
    sync::InMemoryBridge,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("CONSENT_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.node.identity,
        "Starting Consent Server"
    );

    // Keys of managed entities, published so other parties can encrypt for them
    let crypto = Arc::new(LocalCryptoProvider::new(config.node.rsa_key_bits));
    let registry = Arc::new(InMemoryRegistry::new());
    for entity in &config.node.managed_entities {
        crypto.generate_key_pair(entity)?;
        registry.publish_key(entity, crypto.public_key_as_jwk(entity)?, Utc::now());
    }
    tracing::info!(entities = config.node.managed_entities.len(), "Managed entity keys ready");

    let service = Arc::new(ConsentService::new(
        &config,
        Collaborators {
            event_store: Arc::new(InMemoryEventStore::new()),
            crypto,
            registry,
            publisher: Arc::new(InMemoryBridge::new(config.sync.publisher_name.clone())),
            consent_store: Arc::new(InMemoryConsentStore::new()),
            fact_builder: Arc::new(FhirConsentFactBuilder::new()),
            uniqueness: Arc::new(InMemoryUniquenessProjection::new()),
        },
    )?);

    let registrations = service.rebuild_projections().await?;
    tracing::info!(registrations, "Projections rebuilt");

    let mut failures = service.bus().subscribe_errors();
    tokio::spawn(async move {
        while let Ok(failure) = failures.recv().await {
            tracing::error!(
                handler = %failure.handler,
                event_id = %failure.event_id,
                event_type = %failure.event_type,
                error = %failure.message,
                "Saga failed"
            );
        }
    });

    let app = api::build_router(AppState {
        service,
        consent: Arc::new(config.consent.clone()),
        metrics: telemetry.metrics.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
