//! Capability discovery: DNS TXT record resolution plus HTTP agent enumeration, with a
//! TTL-bounded in-process cache and a mock backend for tests and single-domain deployments.

use crate::domain_types::{MessageSize, TtlSeconds};
use crate::error::ErrorKind;
use crate::model::AMTPCapabilities;
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors raised by Discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("DNS lookup failed for {domain}: {reason}")]
    DnsLookupFailed { domain: String, reason: String },

    #[error("no valid capability record for {0}")]
    NoValidRecord(String),

    #[error("no capabilities cached or discoverable for {0}")]
    DiscoveryNotFound(String),

    #[error("agent discovery failed with HTTP status {0}")]
    AgentDiscoveryFailed(u16),

    #[error("failed to decode discovery response: {0}")]
    DecodeFailed(String),
}

impl DiscoveryError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DnsLookupFailed { .. } | Self::NoValidRecord(_) | Self::DiscoveryNotFound(_) => {
                ErrorKind::DiscoveryFailed
            }
            Self::AgentDiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
            Self::DecodeFailed(_) => ErrorKind::DiscoveryFailed,
        }
    }
}

type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// An agent enumerated via `DiscoverAgents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAgent {
    pub address: String,
    pub delivery_mode: String,
    pub active: bool,
}

/// Optional filters accepted by `DiscoverAgents`.
#[derive(Debug, Clone, Default)]
pub struct AgentDiscoveryFilter {
    pub delivery_mode: Option<String>,
}

/// Parses and validates peer capability announcements, with TTL caching.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolves `domain`'s capabilities, from cache if still within TTL, else via DNS.
    ///
    /// # Errors
    ///
    /// `DnsLookupFailed`, `NoValidRecord` on a malformed record.
    async fn discover_capabilities(&self, domain: &str) -> DiscoveryResult<AMTPCapabilities>;

    /// True if `schema` is covered by `domain`'s announced schema list (empty means wildcard).
    ///
    /// # Errors
    ///
    /// Propagates `discover_capabilities` errors.
    async fn supports_schema(&self, domain: &str, schemas: &[crate::domain_types::SchemaName], schema: &crate::domain_types::SchemaName) -> DiscoveryResult<bool> {
        let caps = self.discover_capabilities(domain).await?;
        Ok(caps.supports_schema(schema, schemas))
    }

    /// Enumerates a peer's agents via its discovery HTTP endpoint. Never cached.
    ///
    /// # Errors
    ///
    /// `AgentDiscoveryFailed` on a non-2xx response, `DecodeFailed` on a malformed body.
    async fn discover_agents(
        &self,
        domain: &str,
        filter: AgentDiscoveryFilter,
    ) -> DiscoveryResult<Vec<DiscoveredAgent>>;

    /// MX lookup for SMTP fallback; not used by the core delivery path.
    ///
    /// # Errors
    ///
    /// `DnsLookupFailed` if the lookup itself fails.
    async fn discover_mx_records(&self, domain: &str) -> DiscoveryResult<Vec<String>>;

    /// Flushes every cached capability entry.
    fn clear_cache(&self);
}

/// Parses a `v=amtp1;gateway=...;...` TXT record body into `AMTPCapabilities`.
///
/// # Errors
///
/// `NoValidRecord` if `v` is missing, not `amtp1`, or `gateway` is missing.
pub fn parse_capability_record(record: &str, ttl: TtlSeconds) -> DiscoveryResult<AMTPCapabilities> {
    let mut version = None;
    let mut gateway = None;
    let mut auth = Vec::new();
    let mut max_size = 0usize;
    let mut features = Vec::new();

    for field in record.split(';') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "v" => version = Some(value.to_string()),
            "gateway" => gateway = Some(value.to_string()),
            "auth" => auth = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            "max-size" => max_size = value.parse().unwrap_or(0),
            "features" => features = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            _ => {}
        }
    }

    if version.as_deref() != Some("amtp1") {
        return Err(DiscoveryError::NoValidRecord("missing or unsupported version".to_string()));
    }
    let Some(gateway) = gateway else {
        return Err(DiscoveryError::NoValidRecord("missing gateway field".to_string()));
    };

    Ok(AMTPCapabilities {
        version: "amtp1".to_string(),
        gateway_url: gateway,
        supported_auth_methods: auth,
        max_message_size: MessageSize::try_new(max_size).unwrap_or_default(),
        features,
        discovered_at: chrono::Utc::now(),
        ttl,
    })
}

/// Renders `AMTPCapabilities` back into the `v=amtp1;gateway=...;...` TXT record grammar,
/// the inverse of `parse_capability_record`.
pub fn render_capability_record(capabilities: &AMTPCapabilities) -> String {
    let mut fields = vec![format!("v={}", capabilities.version), format!("gateway={}", capabilities.gateway_url)];
    if !capabilities.supported_auth_methods.is_empty() {
        fields.push(format!("auth={}", capabilities.supported_auth_methods.join(",")));
    }
    fields.push(format!("max-size={}", capabilities.max_message_size.as_usize()));
    if !capabilities.features.is_empty() {
        fields.push(format!("features={}", capabilities.features.join(",")));
    }
    fields.join(";")
}

/// Validates a gateway URL per the `scheme://host[:port][/path]` shape, rejecting plain HTTP
/// unless `allow_insecure_http` is set.
///
/// # Errors
///
/// Returns a plain string reason on any violation; callers wrap it as `INVALID_GATEWAY`.
pub fn validate_gateway_url(raw: &str, allow_insecure_http: bool) -> Result<url::Url, String> {
    let parsed = url::Url::parse(raw).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "https" => {}
        "http" if allow_insecure_http => {}
        other => return Err(format!("unsupported scheme: {other}")),
    }
    let host = parsed.host_str().ok_or_else(|| "missing host".to_string())?;
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(format!("invalid host: {host}"));
    }
    Ok(parsed)
}

/// DNS-backed `Discovery`, caching resolved capabilities per domain.
pub struct DnsDiscovery {
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
    default_ttl: TtlSeconds,
    cache: DashMap<String, AMTPCapabilities>,
}

impl DnsDiscovery {
    /// Builds a resolver from `nameservers` (each `host:port`), falling back to the system
    /// configuration if none are given.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be constructed.
    pub fn new(nameservers: &[String], http: reqwest::Client, default_ttl: TtlSeconds) -> anyhow::Result<Self> {
        let resolver = if nameservers.is_empty() {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        } else {
            let mut config = ResolverConfig::new();
            for server in nameservers {
                let socket_addr: std::net::SocketAddr = server.parse()?;
                config.add_name_server(hickory_resolver::config::NameServerConfig::new(
                    socket_addr,
                    hickory_resolver::config::Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        };
        Ok(Self {
            resolver,
            http,
            default_ttl,
            cache: DashMap::new(),
        })
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn discover_capabilities(&self, domain: &str) -> DiscoveryResult<AMTPCapabilities> {
        if let Some(cached) = self.cache.get(domain) {
            if !cached.is_expired(chrono::Utc::now()) {
                trace!(%domain, "capability cache hit");
                return Ok(cached.clone());
            }
        }

        let name = format!("_amtp.{domain}");
        debug!(%domain, query = %name, "resolving capability TXT record");
        let lookup = self
            .resolver
            .txt_lookup(&name)
            .await
            .map_err(|e| {
                warn!(%domain, error = %e, "DNS TXT lookup failed");
                DiscoveryError::DnsLookupFailed {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let record = lookup
            .iter()
            .find_map(|txt| {
                let text: String = txt.iter().map(|b| String::from_utf8_lossy(b)).collect();
                parse_capability_record(&text, self.default_ttl).ok()
            })
            .ok_or_else(|| {
                warn!(%domain, "no valid AMTP capability record in TXT response");
                DiscoveryError::NoValidRecord(domain.to_string())
            })?;

        self.cache.insert(domain.to_string(), record.clone());
        Ok(record)
    }

    async fn discover_agents(
        &self,
        domain: &str,
        filter: AgentDiscoveryFilter,
    ) -> DiscoveryResult<Vec<DiscoveredAgent>> {
        let caps = self.discover_capabilities(domain).await?;
        let mut url = format!("{}/v1/discovery/agents?active_only=true", caps.gateway_url.trim_end_matches('/'));
        if let Some(mode) = &filter.delivery_mode {
            url.push_str(&format!("&delivery_mode={mode}"));
        }
        debug!(%domain, %url, "enumerating peer agents");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| {
                warn!(%domain, error = %e, "agent discovery request failed");
                DiscoveryError::AgentDiscoveryFailed(0)
            })?;
        let status = response.status();
        if !status.is_success() {
            warn!(%domain, status = status.as_u16(), "agent discovery returned non-success status");
            return Err(DiscoveryError::AgentDiscoveryFailed(status.as_u16()));
        }
        response
            .json::<Vec<DiscoveredAgent>>()
            .await
            .map_err(|e| DiscoveryError::DecodeFailed(e.to_string()))
    }

    async fn discover_mx_records(&self, domain: &str) -> DiscoveryResult<Vec<String>> {
        trace!(%domain, "resolving MX records");
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| {
                warn!(%domain, error = %e, "MX lookup failed");
                DiscoveryError::DnsLookupFailed {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(lookup.iter().map(|mx| mx.exchange().to_string()).collect())
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// In-process `Discovery` substituting a map for DNS, so tests don't touch the network.
pub struct MockDiscovery {
    records: DashMap<String, String>,
    agents: DashMap<String, Vec<DiscoveredAgent>>,
    default_ttl: TtlSeconds,
    cache: DashMap<String, AMTPCapabilities>,
}

impl MockDiscovery {
    /// An empty mock registry.
    pub fn new(default_ttl: TtlSeconds) -> Self {
        Self {
            records: DashMap::new(),
            agents: DashMap::new(),
            default_ttl,
            cache: DashMap::new(),
        }
    }

    /// Registers the raw TXT record body a `discover_capabilities` call for `domain` should
    /// parse.
    pub fn set_record(&self, domain: &str, record: &str) {
        self.records.insert(domain.to_string(), record.to_string());
    }

    /// Registers the agent list a `discover_agents` call for `domain` should return.
    pub fn set_agents(&self, domain: &str, agents: Vec<DiscoveredAgent>) {
        self.agents.insert(domain.to_string(), agents);
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover_capabilities(&self, domain: &str) -> DiscoveryResult<AMTPCapabilities> {
        if let Some(cached) = self.cache.get(domain) {
            if !cached.is_expired(chrono::Utc::now()) {
                return Ok(cached.clone());
            }
        }
        let record = self
            .records
            .get(domain)
            .ok_or_else(|| DiscoveryError::DiscoveryNotFound(domain.to_string()))?;
        let parsed = parse_capability_record(&record, self.default_ttl)?;
        self.cache.insert(domain.to_string(), parsed.clone());
        Ok(parsed)
    }

    async fn discover_agents(
        &self,
        domain: &str,
        _filter: AgentDiscoveryFilter,
    ) -> DiscoveryResult<Vec<DiscoveredAgent>> {
        self.discover_capabilities(domain).await?;
        Ok(self.agents.get(domain).map(|a| a.clone()).unwrap_or_default())
    }

    async fn discover_mx_records(&self, _domain: &str) -> DiscoveryResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}
