//! Agent Registry: an in-process cache of `LocalAgent` records, backed by `Storage`.
//!
//! Addresses are canonicalised on every call — a bare name gets the gateway's configured
//! local domain appended — so callers may use either form interchangeably, mirroring the
//! teacher's `AgentRegistryImpl` dashmap-of-identities shape in `message_router`.

use crate::domain_types::{Address, ApiKeySalt, LocalDomain, SchemaName};
use crate::error::ErrorKind;
use crate::model::LocalAgent;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the Agent Registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already exists: {0}")]
    AgentAlreadyExists(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid API key")]
    InvalidKey,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RegistryError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotFound(_) => ErrorKind::AgentNotFound,
            Self::AgentAlreadyExists(_) | Self::InvalidAddress(_) => ErrorKind::ValidationFailed,
            Self::InvalidKey => ErrorKind::AccessDenied,
            Self::Storage(e) => e.kind(),
        }
    }
}

type RegistryResult<T> = Result<T, RegistryError>;

/// Registry statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub push_agents: usize,
    pub pull_agents: usize,
}

/// In-process agent registry, caching every `LocalAgent` in a `DashMap` keyed by canonical
/// address, refreshed from `Storage` on construction and kept consistent with it on writes.
pub struct AgentRegistry {
    storage: Arc<dyn Storage>,
    local_domain: LocalDomain,
    api_key_salt: ApiKeySalt,
    agents: DashMap<Address, LocalAgent>,
}

impl AgentRegistry {
    /// Loads every agent from `storage` into the in-process cache.
    ///
    /// # Errors
    ///
    /// Propagates any `Storage::list_agents` failure.
    pub async fn load(
        storage: Arc<dyn Storage>,
        local_domain: LocalDomain,
        api_key_salt: ApiKeySalt,
    ) -> RegistryResult<Self> {
        let agents = DashMap::new();
        for agent in storage.list_agents().await? {
            agents.insert(agent.address.clone(), agent);
        }
        info!(agent_count = agents.len(), "agent registry loaded from storage");
        Ok(Self {
            storage,
            local_domain,
            api_key_salt,
            agents,
        })
    }

    /// The gateway's own routing domain.
    pub fn local_domain(&self) -> &LocalDomain {
        &self.local_domain
    }

    /// Appends `@<local_domain>` to a bare name; leaves an already-qualified address untouched.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidAddress` if the resulting string is not a well-formed
    /// `name@domain` address.
    pub fn canonicalize(&self, input: &str) -> RegistryResult<Address> {
        let candidate = if input.contains('@') {
            input.to_string()
        } else {
            format!("{input}@{}", self.local_domain)
        };
        Address::try_new(candidate).map_err(|e| RegistryError::InvalidAddress(e.to_string()))
    }

    fn hash_key(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key_salt.as_ref().as_bytes());
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn generate_key() -> String {
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        hex::encode(bytes)
    }

    /// Registers a new agent with the given attributes, generating a fresh API key.
    ///
    /// # Errors
    ///
    /// `AgentAlreadyExists` if the canonical address is already registered.
    pub async fn register(
        &self,
        address: Address,
        delivery_mode: crate::model::DeliveryMode,
        push_target: Option<String>,
        supported_schemas: Vec<SchemaName>,
        requires_schema: bool,
    ) -> RegistryResult<String> {
        if self.agents.contains_key(&address) {
            return Err(RegistryError::AgentAlreadyExists(address.to_string()));
        }
        let plaintext_key = Self::generate_key();
        let agent = LocalAgent {
            address: address.clone(),
            delivery_mode,
            push_target,
            request_headers: std::collections::HashMap::new(),
            hashed_api_key: self.hash_key(&plaintext_key),
            supported_schemas,
            requires_schema,
            created_at: chrono::Utc::now(),
            last_access: None,
        };
        self.storage.create_agent(agent.clone()).await?;
        self.agents.insert(address.clone(), agent);
        info!(%address, ?delivery_mode, "agent registered");
        Ok(plaintext_key)
    }

    /// Removes an agent from both the cache and storage.
    ///
    /// # Errors
    ///
    /// `AgentNotFound` if no such agent is registered.
    pub async fn unregister(&self, address: &Address) -> RegistryResult<()> {
        self.storage
            .delete_agent(address)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => RegistryError::AgentNotFound(address.to_string()),
                other => other.into(),
            })?;
        self.agents.remove(address);
        info!(%address, "agent unregistered");
        Ok(())
    }

    /// Reads a cached agent by address.
    ///
    /// # Errors
    ///
    /// `AgentNotFound` if no such agent is registered.
    pub fn get(&self, address: &Address) -> RegistryResult<LocalAgent> {
        self.agents
            .get(address)
            .map(|a| a.clone())
            .ok_or_else(|| RegistryError::AgentNotFound(address.to_string()))
    }

    /// Lists every cached agent.
    pub fn list(&self) -> Vec<LocalAgent> {
        self.agents.iter().map(|a| a.value().clone()).collect()
    }

    /// Touches `last_access` for `address`, persisting the change.
    ///
    /// # Errors
    ///
    /// `AgentNotFound` if no such agent is registered.
    pub async fn update_last_access(&self, address: &Address) -> RegistryResult<()> {
        let mut agent = self.get(address)?;
        agent.last_access = Some(chrono::Utc::now());
        self.storage.update_agent(agent.clone()).await?;
        self.agents.insert(address.clone(), agent);
        Ok(())
    }

    /// Returns true iff `address` exists and `H(salt || key)` matches the stored digest.
    pub fn verify_api_key(&self, address: &Address, key: &str) -> bool {
        match self.agents.get(address) {
            Some(agent) => agent.hashed_api_key == self.hash_key(key),
            None => {
                warn!(%address, "API key check against unknown agent");
                false
            }
        }
    }

    /// Generates a new API key for `address`, persisting its digest atomically.
    ///
    /// # Errors
    ///
    /// `AgentNotFound` if no such agent is registered.
    pub async fn rotate_api_key(&self, address: &Address) -> RegistryResult<String> {
        let mut agent = self.get(address)?;
        let plaintext_key = Self::generate_key();
        agent.hashed_api_key = self.hash_key(&plaintext_key);
        self.storage.update_agent(agent.clone()).await?;
        self.agents.insert(address.clone(), agent);
        debug!(%address, "API key rotated");
        Ok(plaintext_key)
    }

    /// The union of every registered agent's supported-schema list.
    pub fn supported_schemas(&self) -> Vec<SchemaName> {
        let mut schemas: Vec<SchemaName> = self
            .agents
            .iter()
            .flat_map(|a| a.supported_schemas.clone())
            .collect();
        schemas.sort();
        schemas.dedup();
        schemas
    }

    /// Aggregate counts of registered agents by delivery mode.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_agents: self.agents.len(),
            ..Default::default()
        };
        for agent in &self.agents {
            match agent.delivery_mode {
                crate::model::DeliveryMode::Push => stats.push_agents += 1,
                crate::model::DeliveryMode::Pull => stats.pull_agents += 1,
            }
        }
        stats
    }
}

/// Narrow surface the Inbox Service depends on, so it can be mocked independently of the full
/// registry in tests.
#[async_trait]
pub trait ApiKeyVerifier: Send + Sync {
    /// Returns true iff `address` is registered and `key` matches its stored digest.
    fn verify_api_key(&self, address: &Address, key: &str) -> bool;

    /// Touches `last_access` for `address`.
    async fn touch_last_access(&self, address: &Address) -> RegistryResult<()>;
}

#[async_trait]
impl ApiKeyVerifier for AgentRegistry {
    fn verify_api_key(&self, address: &Address, key: &str) -> bool {
        AgentRegistry::verify_api_key(self, address, key)
    }

    async fn touch_last_access(&self, address: &Address) -> RegistryResult<()> {
        self.update_last_access(address).await
    }
}
