//! HTTP surface: peer-to-peer AMTP endpoints, an ambient ingress endpoint for local clients,
//! inbox access, and a health check — modeled on the teacher's `rest_api` boundary-validation
//! pattern (typed request/response bodies, `ErrorResponse` JSON on failure).

use crate::delivery::DeliveryEngine;
use crate::domain_types::{Address, IdempotencyKey, MessageId, SchemaName};
use crate::error::ErrorKind;
use crate::inbox::InboxService;
use crate::model::Message;
use crate::processor::{MessageProcessor, ProcessingOptions};
use crate::registry::AgentRegistry;
use crate::storage::Storage;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<AgentRegistry>,
    pub processor: Arc<MessageProcessor>,
    pub delivery: Arc<dyn DeliveryEngine>,
    pub inbox: Arc<InboxService>,
}

/// JSON body returned for any non-2xx response.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error_code: &'static str,
    message: String,
}

fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = message.into();
    warn!(error_code = kind.code(), %message, "request rejected");
    (
        status,
        Json(ErrorResponse {
            error_code: kind.code(),
            message,
        }),
    )
        .into_response()
}

/// Builds the full router: peer-to-peer, ingress, inbox, and health-check routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(receive_peer_message))
        .route("/v1/discovery/agents", get(discover_agents))
        .route("/v1/send", post(send_message))
        .route("/v1/inbox/{address}", get(get_inbox))
        .route("/v1/inbox/{address}/ack/{message_id}", post(acknowledge_message))
        .route("/healthz", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Response {
    match state.storage.get_stats().await {
        Ok(stats) => Json(stats_to_json(&stats)).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    total_messages: u64,
}

fn stats_to_json(stats: &crate::storage::StorageStats) -> HealthBody {
    HealthBody {
        status: "ok",
        total_messages: stats.total_messages,
    }
}

/// `POST /v1/messages` — accepts a peer's relayed message and delivers it to local recipients.
async fn receive_peer_message(State(state): State<AppState>, Json(message): Json<Message>) -> Response {
    debug!(message_id = %message.message_id, recipient_count = message.recipients.len(), "peer message received");
    match state
        .processor
        .process_message(message, ProcessingOptions::default())
        .await
    {
        Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryQuery {
    delivery_mode: Option<String>,
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Serialize)]
struct DiscoveredAgentBody {
    address: String,
    delivery_mode: String,
    supported_schemas: Vec<SchemaName>,
    created_at: chrono::DateTime<chrono::Utc>,
    last_active: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct DiscoveryResponse {
    agents: Vec<DiscoveredAgentBody>,
    agent_count: usize,
    domain: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// `GET /v1/discovery/agents` — enumerates this gateway's local agents for a remote peer.
async fn discover_agents(State(state): State<AppState>, Query(query): Query<DiscoveryQuery>) -> Response {
    let agents: Vec<DiscoveredAgentBody> = state
        .registry
        .list()
        .into_iter()
        .filter(|agent| {
            query
                .delivery_mode
                .as_deref()
                .is_none_or(|mode| mode == delivery_mode_str(agent.delivery_mode))
        })
        .filter(|agent| !query.active_only || agent.last_access.is_some())
        .map(|agent| DiscoveredAgentBody {
            address: agent.address.to_string(),
            delivery_mode: delivery_mode_str(agent.delivery_mode).to_string(),
            supported_schemas: agent.supported_schemas.clone(),
            created_at: agent.created_at,
            last_active: agent.last_access,
        })
        .collect();

    Json(DiscoveryResponse {
        agent_count: agents.len(),
        agents,
        domain: state.registry.local_domain().to_string(),
        timestamp: chrono::Utc::now(),
    })
    .into_response()
}

fn delivery_mode_str(mode: crate::model::DeliveryMode) -> &'static str {
    match mode {
        crate::model::DeliveryMode::Push => "push",
        crate::model::DeliveryMode::Pull => "pull",
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    sender: String,
    recipients: Vec<String>,
    subject: Option<String>,
    schema: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    payload: String,
    idempotency_key: Option<String>,
}

/// `POST /v1/send` — ambient ingress accepted directly from local clients (not a peer
/// gateway). Not part of the peer-to-peer contract; JSON framing only, no auth/rate-limiting
/// beyond what sits in front of this process.
async fn send_message(State(state): State<AppState>, Json(request): Json<SendMessageRequest>) -> Response {
    let sender = match Address::try_new(request.sender) {
        Ok(addr) => addr,
        Err(e) => return error_response(ErrorKind::InvalidRequestFormat, e.to_string()),
    };
    let mut recipients = Vec::with_capacity(request.recipients.len());
    for raw in request.recipients {
        match Address::try_new(raw) {
            Ok(addr) => recipients.push(addr),
            Err(e) => return error_response(ErrorKind::InvalidRecipient, e.to_string()),
        }
    }
    let schema = match request.schema.map(SchemaName::try_new).transpose() {
        Ok(schema) => schema,
        Err(e) => return error_response(ErrorKind::ValidationFailed, e.to_string()),
    };
    let idempotency_key = match request.idempotency_key {
        Some(raw) => match IdempotencyKey::try_from(uuid::Uuid::parse_str(&raw).unwrap_or_default()) {
            Ok(key) => key,
            Err(_) => IdempotencyKey::generate(),
        },
        None => derive_idempotency_key(&request.payload),
    };

    let message = match Message::accept(
        idempotency_key,
        sender,
        recipients,
        request.subject,
        schema,
        request.headers,
        request.payload.into_bytes(),
        None,
    ) {
        Ok(message) => message,
        Err(e) => return error_response(ErrorKind::ValidationFailed, e.to_string()),
    };

    match state.processor.process_message(message, ProcessingOptions::default()).await {
        Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}

fn derive_idempotency_key(payload: &str) -> IdempotencyKey {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(payload.as_bytes());
    let bytes: [u8; 16] = digest[..16].try_into().unwrap_or([0; 16]);
    IdempotencyKey::try_from(uuid::Uuid::from_bytes(bytes)).unwrap_or_else(|_| IdempotencyKey::generate())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// `GET /v1/inbox/{address}` — returns undelivered-to-app messages for `address`.
async fn get_inbox(State(state): State<AppState>, Path(address): Path<String>, headers: HeaderMap) -> Response {
    let recipient = match Address::try_new(address) {
        Ok(addr) => addr,
        Err(e) => return error_response(ErrorKind::InvalidRequestFormat, e.to_string()),
    };
    let api_key = extract_bearer(&headers);
    match state.inbox.get_inbox(&recipient, api_key.as_deref()).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}

/// `POST /v1/inbox/{address}/ack/{message_id}` — acknowledges receipt of a pulled message.
async fn acknowledge_message(
    State(state): State<AppState>,
    Path((address, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let recipient = match Address::try_new(address) {
        Ok(addr) => addr,
        Err(e) => return error_response(ErrorKind::InvalidRequestFormat, e.to_string()),
    };
    let message_id = match uuid::Uuid::parse_str(&message_id).ok().and_then(|u| MessageId::try_from(u).ok()) {
        Some(id) => id,
        None => return error_response(ErrorKind::InvalidRequestFormat, "malformed message id"),
    };
    let api_key = extract_bearer(&headers);
    match state.inbox.acknowledge_message(&recipient, api_key.as_deref(), message_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}
