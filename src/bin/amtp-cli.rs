//! AMTP Gateway CLI — administrative operations against a gateway's storage backend, and a
//! thin HTTP client for sending a message through a running gateway.

use amtp_gateway::config::{GatewayConfig, StorageBackend};
use amtp_gateway::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use amtp_gateway::domain_types::{Address, SchemaName};
use amtp_gateway::model::DeliveryMode;
use amtp_gateway::registry::AgentRegistry;
use amtp_gateway::storage::{InMemoryStorage, RelationalStorage, Storage};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "amtp-cli", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to a `GatewayConfig` JSON file; falls back to `GatewayConfig::development()`.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Registers a new local agent and prints its plaintext API key.
    Register {
        address: String,
        #[arg(long, value_enum, default_value = "pull")]
        mode: ModeArg,
        #[arg(long)]
        push_target: Option<String>,
        #[arg(long = "schema")]
        schemas: Vec<String>,
    },
    /// Generates a fresh API key for an already-registered agent.
    RotateKey { address: String },
    /// Removes a local agent.
    Unregister { address: String },
    /// Lists every registered local agent.
    List,
    /// Sends a message through a running gateway's `/v1/send` endpoint.
    Send {
        #[arg(long)]
        gateway_url: String,
        #[arg(long)]
        sender: String,
        #[arg(long = "to")]
        recipients: Vec<String>,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        subject: Option<String>,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum ModeArg {
    Push,
    Pull,
}

async fn build_registry(config_path: Option<&str>) -> Result<(Arc<dyn Storage>, AgentRegistry)> {
    let config = match config_path {
        Some(path) => GatewayConfig::load_from_file(path)?,
        None => GatewayConfig::development(),
    };
    let storage: Arc<dyn Storage> = match &config.storage_backend {
        StorageBackend::InMemory => Arc::new(InMemoryStorage::new(config.storage_capacity)),
        StorageBackend::Relational { path } => {
            let connection = DatabaseConnection::initialize(DatabaseConfig::new(DatabasePath::new(path)?)).await?;
            Arc::new(RelationalStorage::new(connection))
        }
    };
    let registry = AgentRegistry::load(storage.clone(), config.local_domain, config.api_key_salt).await?;
    Ok((storage, registry))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Register { address, mode, push_target, schemas } => {
            let (_storage, registry) = build_registry(args.config.as_deref()).await?;
            let address = Address::try_new(address).context("invalid address")?;
            let delivery_mode = match mode {
                ModeArg::Push => DeliveryMode::Push,
                ModeArg::Pull => DeliveryMode::Pull,
            };
            if matches!(delivery_mode, DeliveryMode::Push) && push_target.is_none() {
                bail!("--push-target is required for push-mode agents");
            }
            let schemas = schemas
                .into_iter()
                .map(SchemaName::try_new)
                .collect::<Result<Vec<_>, _>>()
                .context("invalid schema name")?;
            let key = registry.register(address, delivery_mode, push_target, schemas, false).await?;
            println!("registered; API key: {key}");
        }
        Command::RotateKey { address } => {
            let (_storage, registry) = build_registry(args.config.as_deref()).await?;
            let address = Address::try_new(address).context("invalid address")?;
            let key = registry.rotate_api_key(&address).await?;
            println!("new API key: {key}");
        }
        Command::Unregister { address } => {
            let (_storage, registry) = build_registry(args.config.as_deref()).await?;
            let address = Address::try_new(address).context("invalid address")?;
            registry.unregister(&address).await?;
            println!("unregistered {address}");
        }
        Command::List => {
            let (_storage, registry) = build_registry(args.config.as_deref()).await?;
            for agent in registry.list() {
                println!("{} ({:?})", agent.address, agent.delivery_mode);
            }
        }
        Command::Send { gateway_url, sender, recipients, payload, subject } => {
            let client = reqwest::Client::new();
            let body = serde_json::json!({
                "sender": sender,
                "recipients": recipients,
                "payload": payload,
                "subject": subject,
            });
            let response = client
                .post(format!("{}/v1/send", gateway_url.trim_end_matches('/')))
                .json(&body)
                .send()
                .await
                .context("request failed")?;
            println!("status: {}", response.status());
            println!("{}", response.text().await.unwrap_or_default());
        }
    }

    Ok(())
}
