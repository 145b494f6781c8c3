//! Gateway configuration.
//!
//! Grouped by concern the way the teacher groups `RouterConfig`: routing/HTTP client, retry,
//! discovery, storage, and security. Every numeric or string knob is validated at construction
//! via its `nutype` wrapper; `GatewayConfig::validate` additionally checks cross-field
//! relationships.

use crate::domain_types::{
    ApiKeySalt, BaseRetryDelayMs, BatchConcurrency, HttpTimeoutMs, IdleTimeoutMs, LocalDomain,
    MaxConnections, MaxRetries, MessageSize, StorageCapacity, TtlSeconds,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which `Storage` backing the gateway should construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageBackend {
    /// `dashmap`-backed in-memory storage, bounded by `storage_capacity`.
    InMemory,
    /// `sqlx`/SQLite-backed relational storage at the given path.
    Relational { path: PathBuf },
}

/// Which `Discovery` backing the gateway should construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiscoveryBackend {
    /// Real DNS TXT lookups via the configured resolvers.
    Dns { resolvers: Vec<String> },
    /// An in-process table, for tests and single-domain deployments.
    Mock,
}

/// Complete, validated gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// This gateway's own routing domain.
    pub local_domain: LocalDomain,

    // Outbound HTTP client (shared by Delivery and Discovery).
    pub http_timeout_ms: HttpTimeoutMs,
    pub max_connections: MaxConnections,
    pub idle_timeout_ms: IdleTimeoutMs,
    pub user_agent: String,
    pub allow_insecure_http_gateways: bool,

    // Retry / backoff.
    pub max_retries: MaxRetries,
    pub base_retry_delay_ms: BaseRetryDelayMs,
    pub batch_concurrency: BatchConcurrency,

    // Message limits.
    pub max_message_size: MessageSize,

    // Discovery.
    pub discovery_timeout_ms: HttpTimeoutMs,
    pub default_capability_ttl: TtlSeconds,
    pub discovery_backend: DiscoveryBackend,

    // Storage.
    pub storage_backend: StorageBackend,
    pub storage_capacity: StorageCapacity,

    // Security.
    pub api_key_salt: ApiKeySalt,
}

impl GatewayConfig {
    /// A configuration suitable for local development: in-memory storage, mock discovery,
    /// aggressive timeouts for fast feedback.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded literal is out of range for its domain type (never, in practice).
    pub fn development() -> Self {
        Self {
            local_domain: LocalDomain::try_new("local").unwrap(),
            http_timeout_ms: HttpTimeoutMs::try_new(10_000).unwrap(),
            max_connections: MaxConnections::try_new(50).unwrap(),
            idle_timeout_ms: IdleTimeoutMs::try_new(30_000).unwrap(),
            user_agent: format!("AMTP-Gateway/{}", env!("CARGO_PKG_VERSION")),
            allow_insecure_http_gateways: true,
            max_retries: MaxRetries::try_new(3).unwrap(),
            base_retry_delay_ms: BaseRetryDelayMs::try_new(1_000).unwrap(),
            batch_concurrency: BatchConcurrency::try_new(16).unwrap(),
            max_message_size: MessageSize::try_new(10 * 1024 * 1024).unwrap(),
            discovery_timeout_ms: HttpTimeoutMs::try_new(5_000).unwrap(),
            default_capability_ttl: TtlSeconds::try_new(300).unwrap(),
            discovery_backend: DiscoveryBackend::Mock,
            storage_backend: StorageBackend::InMemory,
            storage_capacity: StorageCapacity::try_new(100_000).unwrap(),
            api_key_salt: ApiKeySalt::try_new("development-salt-change-me").unwrap(),
        }
    }

    /// A configuration tuned for production: relational storage, real DNS discovery, HTTPS only.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded literal is out of range for its domain type (never, in practice).
    pub fn production(local_domain: LocalDomain, api_key_salt: ApiKeySalt) -> Self {
        Self {
            local_domain,
            http_timeout_ms: HttpTimeoutMs::try_new(30_000).unwrap(),
            max_connections: MaxConnections::try_new(500).unwrap(),
            idle_timeout_ms: IdleTimeoutMs::try_new(90_000).unwrap(),
            user_agent: format!("AMTP-Gateway/{}", env!("CARGO_PKG_VERSION")),
            allow_insecure_http_gateways: false,
            max_retries: MaxRetries::try_new(3).unwrap(),
            base_retry_delay_ms: BaseRetryDelayMs::try_new(1_000).unwrap(),
            batch_concurrency: BatchConcurrency::try_new(64).unwrap(),
            max_message_size: MessageSize::try_new(10 * 1024 * 1024).unwrap(),
            discovery_timeout_ms: HttpTimeoutMs::try_new(5_000).unwrap(),
            default_capability_ttl: TtlSeconds::try_new(3_600).unwrap(),
            discovery_backend: DiscoveryBackend::Dns {
                resolvers: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
            },
            storage_backend: StorageBackend::Relational {
                path: PathBuf::from("./data/amtp-gateway.db"),
            },
            storage_capacity: StorageCapacity::try_new(1_000_000).unwrap(),
            api_key_salt,
        }
    }

    /// Minimal-resource configuration for test suites.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded literal is out of range for its domain type (never, in practice).
    pub fn testing() -> Self {
        Self {
            local_domain: LocalDomain::try_new("local").unwrap(),
            http_timeout_ms: HttpTimeoutMs::try_new(2_000).unwrap(),
            max_connections: MaxConnections::try_new(4).unwrap(),
            idle_timeout_ms: IdleTimeoutMs::try_new(5_000).unwrap(),
            user_agent: "AMTP-Gateway/test".to_string(),
            allow_insecure_http_gateways: true,
            max_retries: MaxRetries::try_new(3).unwrap(),
            base_retry_delay_ms: BaseRetryDelayMs::try_new(10).unwrap(),
            batch_concurrency: BatchConcurrency::try_new(8).unwrap(),
            max_message_size: MessageSize::try_new(1024 * 1024).unwrap(),
            discovery_timeout_ms: HttpTimeoutMs::try_new(1_000).unwrap(),
            default_capability_ttl: TtlSeconds::try_new(60).unwrap(),
            discovery_backend: DiscoveryBackend::Mock,
            storage_backend: StorageBackend::InMemory,
            storage_capacity: StorageCapacity::try_new(1_000).unwrap(),
            api_key_salt: ApiKeySalt::try_new("test-salt").unwrap(),
        }
    }

    /// Validates cross-field relationships not captured by individual `nutype` bounds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when fields are mutually inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.discovery_backend, DiscoveryBackend::Dns { ref resolvers } if resolvers.is_empty())
        {
            return Err(ConfigError::Validation {
                field: "discovery_backend".to_string(),
                reason: "DNS backend requires at least one resolver".to_string(),
            });
        }

        if self.discovery_timeout_ms.as_duration() > self.http_timeout_ms.as_duration() {
            return Err(ConfigError::Validation {
                field: "discovery_timeout_ms".to_string(),
                reason: "must not exceed http_timeout_ms".to_string(),
            });
        }

        Ok(())
    }

    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read, parsed, or fails validation.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if serialisation or the file write fails.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_config_is_valid() {
        assert!(GatewayConfig::development().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(GatewayConfig::testing().validate().is_ok());
    }

    #[test]
    fn dns_backend_requires_resolvers() {
        let mut config = GatewayConfig::testing();
        config.discovery_backend = DiscoveryBackend::Dns { resolvers: vec![] };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json_file() {
        let config = GatewayConfig::testing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.save_to_file(&path).unwrap();
        let loaded = GatewayConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.local_domain, config.local_domain);
        assert_eq!(loaded.max_message_size, config.max_message_size);
    }
}
