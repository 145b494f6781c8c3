//! AMTP Gateway — entry point for the gateway server process.

use amtp_gateway::config::{DiscoveryBackend, GatewayConfig, StorageBackend};
use amtp_gateway::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use amtp_gateway::delivery::{DefaultDeliveryEngine, DeliveryEngine};
use amtp_gateway::discovery::{Discovery, DnsDiscovery, MockDiscovery};
use amtp_gateway::inbox::InboxService;
use amtp_gateway::processor::MessageProcessor;
use amtp_gateway::registry::{AgentRegistry, ApiKeyVerifier};
use amtp_gateway::server::{self, AppState};
use amtp_gateway::storage::{InMemoryStorage, RelationalStorage, Storage};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("amtp_gateway=info".parse()?),
        )
        .init();

    info!("starting AMTP gateway");

    let config = match std::env::var("AMTP_CONFIG_PATH") {
        Ok(path) => GatewayConfig::load_from_file(path)?,
        Err(_) => GatewayConfig::development(),
    };
    config.validate()?;
    info!(domain = %config.local_domain, "configuration loaded");

    let storage: Arc<dyn Storage> = match &config.storage_backend {
        StorageBackend::InMemory => Arc::new(InMemoryStorage::new(config.storage_capacity)),
        StorageBackend::Relational { path } => {
            let db_path = DatabasePath::new(path)?;
            let db_config = DatabaseConfig::new(db_path);
            let connection = DatabaseConnection::initialize(db_config).await?;
            Arc::new(RelationalStorage::new(connection))
        }
    };

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout_ms.as_duration())
        .pool_idle_timeout(config.idle_timeout_ms.as_duration())
        .pool_max_idle_per_host(config.max_connections.as_usize())
        .user_agent(config.user_agent.clone())
        .build()?;

    let discovery: Arc<dyn Discovery> = match &config.discovery_backend {
        DiscoveryBackend::Dns { resolvers } => {
            Arc::new(DnsDiscovery::new(resolvers, http.clone(), config.default_capability_ttl)?)
        }
        DiscoveryBackend::Mock => Arc::new(MockDiscovery::new(config.default_capability_ttl)),
    };

    let registry = Arc::new(
        AgentRegistry::load(storage.clone(), config.local_domain.clone(), config.api_key_salt.clone()).await?,
    );

    let delivery: Arc<dyn DeliveryEngine> = Arc::new(DefaultDeliveryEngine::new(
        storage.clone(),
        registry.clone(),
        discovery.clone(),
        http,
        config.local_domain.to_string(),
        config.user_agent.clone(),
        config.max_retries,
        config.base_retry_delay_ms,
        config.batch_concurrency.as_usize(),
        config.allow_insecure_http_gateways,
    ));

    let processor = Arc::new(MessageProcessor::new(storage.clone(), delivery.clone()));
    let verifier: Arc<dyn ApiKeyVerifier> = registry.clone();
    let inbox = Arc::new(InboxService::new(storage.clone(), verifier));

    let state = AppState {
        storage,
        registry,
        processor,
        delivery,
        inbox,
    };

    let app = server::build_router(state);
    let bind_addr = std::env::var("AMTP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "AMTP gateway listening");

    axum::serve(listener, app).await?;

    info!("AMTP gateway shutting down");
    Ok(())
}
