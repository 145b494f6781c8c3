//! End-to-end scenarios exercising the full accept → dispatch → aggregate → persist path
//! against an in-memory `Storage`, a mock `Discovery`, and a real (in-process) peer HTTP server.

use amtp_gateway::config::GatewayConfig;
use amtp_gateway::delivery::{DefaultDeliveryEngine, DeliveryEngine};
use amtp_gateway::discovery::{Discovery, MockDiscovery};
use amtp_gateway::domain_types::{Address, IdempotencyKey};
use amtp_gateway::inbox::InboxService;
use amtp_gateway::model::{CoordinationConfig, DeliveryMode, DeliveryStatus, Message};
use amtp_gateway::processor::{MessageProcessor, ProcessingOptions};
use amtp_gateway::registry::{AgentRegistry, ApiKeyVerifier};
use amtp_gateway::storage::{InMemoryStorage, Storage};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Spawns an in-process peer that answers `POST /v1/messages` with the given sequence of
/// HTTP statuses (the last status repeats once the sequence is exhausted). Returns its base URL.
async fn spawn_mock_peer(statuses: Vec<u16>) -> String {
    let state = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(statuses);

    async fn handler(
        State((state, statuses)): State<(Arc<AtomicUsize>, Arc<Vec<u16>>)>,
        Json(_body): Json<serde_json::Value>,
    ) -> impl IntoResponse {
        let attempt = state.fetch_add(1, Ordering::SeqCst);
        let idx = attempt.min(statuses.len() - 1);
        axum::http::StatusCode::from_u16(statuses[idx]).unwrap()
    }

    let app = Router::new()
        .route("/v1/messages", post(handler))
        .with_state((state, statuses));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    processor: Arc<MessageProcessor>,
    inbox: Arc<InboxService>,
}

async fn harness(peer_base_url: Option<&str>) -> Harness {
    let config = GatewayConfig::testing();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(config.storage_capacity));
    let registry = Arc::new(
        AgentRegistry::load(storage.clone(), config.local_domain.clone(), config.api_key_salt.clone())
            .await
            .unwrap(),
    );

    let discovery = Arc::new(MockDiscovery::new(config.default_capability_ttl));
    if let Some(url) = peer_base_url {
        discovery.set_record("peer.example", &format!("v=amtp1;gateway={url}"));
    }
    let discovery: Arc<dyn Discovery> = discovery;

    let http = reqwest::Client::new();
    let delivery: Arc<dyn DeliveryEngine> = Arc::new(DefaultDeliveryEngine::new(
        storage.clone(),
        registry.clone(),
        discovery,
        http,
        config.local_domain.to_string(),
        config.user_agent.clone(),
        config.max_retries,
        config.base_retry_delay_ms,
        config.batch_concurrency.as_usize(),
        config.allow_insecure_http_gateways,
    ));

    let processor = Arc::new(MessageProcessor::new(storage.clone(), delivery));
    let verifier: Arc<dyn ApiKeyVerifier> = registry.clone();
    let inbox = Arc::new(InboxService::new(storage.clone(), verifier));

    Harness { storage, registry, processor, inbox }
}

fn message(sender: &str, recipients: &[&str], coordination: Option<CoordinationConfig>) -> Message {
    Message::accept(
        IdempotencyKey::generate(),
        Address::try_new(sender).unwrap(),
        recipients.iter().map(|r| Address::try_new(*r).unwrap()).collect(),
        None,
        None,
        HashMap::new(),
        b"payload".to_vec(),
        coordination,
    )
    .unwrap()
}

#[tokio::test]
async fn parallel_local_and_remote_mixed() {
    let peer = spawn_mock_peer(vec![200]).await;
    let h = harness(Some(&peer)).await;
    h.registry
        .register(Address::try_new("alice@local").unwrap(), DeliveryMode::Pull, None, vec![], false)
        .await
        .unwrap();

    let msg = message("sender@local", &["alice@local", "bob@peer.example"], None);
    let result = h.processor.process_message(msg, ProcessingOptions::default()).await.unwrap();

    assert_eq!(result.overall_status, DeliveryStatus::Delivered);
    let alice = result.recipient_results.iter().find(|(a, _)| a.to_string() == "alice@local").unwrap();
    assert_eq!(alice.1.delivery_mode, DeliveryMode::Pull);
    assert!(alice.1.local_delivery);
    let bob = result.recipient_results.iter().find(|(a, _)| a.to_string() == "bob@peer.example").unwrap();
    assert_eq!(bob.1.delivery_mode, DeliveryMode::Push);
    assert_eq!(bob.1.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn idempotent_replay_returns_first_result() {
    let peer = spawn_mock_peer(vec![200]).await;
    let h = harness(Some(&peer)).await;

    let key = IdempotencyKey::generate();
    let first = Message::accept(
        key,
        Address::try_new("sender@local").unwrap(),
        vec![Address::try_new("bob@peer.example").unwrap()],
        Some("first".to_string()),
        None,
        HashMap::new(),
        b"payload".to_vec(),
        None,
    )
    .unwrap();
    let second = Message::accept(
        key,
        Address::try_new("sender@local").unwrap(),
        vec![Address::try_new("bob@peer.example").unwrap()],
        Some("second".to_string()),
        None,
        HashMap::new(),
        b"payload".to_vec(),
        None,
    )
    .unwrap();

    let first_result = h.processor.process_message(first, ProcessingOptions::default()).await.unwrap();
    let second_result = h.processor.process_message(second, ProcessingOptions::default()).await.unwrap();

    assert_eq!(first_result.message_id, second_result.message_id);
    assert_eq!(first_result.overall_status, second_result.overall_status);

    let stored = h.storage.list_messages(Default::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn remote_retries_after_503_then_succeeds() {
    let peer = spawn_mock_peer(vec![503, 200]).await;
    let h = harness(Some(&peer)).await;

    let msg = message("sender@local", &["bob@peer.example"], None);
    let result = h.processor.process_message(msg, ProcessingOptions::default()).await.unwrap();

    assert_eq!(result.overall_status, DeliveryStatus::Delivered);
    let (_, delivery) = &result.recipient_results[0];
    assert_eq!(delivery.attempt_count, 2);
}

#[tokio::test]
async fn sequential_stops_after_first_failure() {
    let peer = spawn_mock_peer(vec![400]).await;
    let h = harness(Some(&peer)).await;

    let sequence = vec![
        Address::try_new("a@peer.example").unwrap(),
        Address::try_new("b@peer.example").unwrap(),
        Address::try_new("c@peer.example").unwrap(),
    ];
    let coordination = CoordinationConfig::sequential(sequence, true).unwrap();
    let msg = message("sender@local", &["a@peer.example", "b@peer.example", "c@peer.example"], Some(coordination));

    let result = h.processor.process_message(msg, ProcessingOptions::default()).await.unwrap();

    assert_eq!(result.overall_status, DeliveryStatus::Failed);
    assert_eq!(result.recipient_results.len(), 3);
    assert_eq!(result.recipient_results[0].1.status, DeliveryStatus::Failed);
    assert_eq!(result.recipient_results[1].1.status, DeliveryStatus::Queued);
    assert_eq!(result.recipient_results[2].1.status, DeliveryStatus::Queued);
}

#[tokio::test]
async fn acknowledge_flow_then_second_acknowledge_rejected() {
    let h = harness(None).await;
    let address = Address::try_new("x@local").unwrap();
    let key = h
        .registry
        .register(address.clone(), DeliveryMode::Pull, None, vec![], false)
        .await
        .unwrap();

    let msg = message("sender@local", &["x@local"], None);
    let result = h.processor.process_message(msg, ProcessingOptions::default()).await.unwrap();
    assert_eq!(result.overall_status, DeliveryStatus::Delivered);

    let inbox_messages = h.inbox.get_inbox(&address, Some(&key)).await.unwrap();
    assert_eq!(inbox_messages.len(), 1);

    h.inbox.acknowledge_message(&address, Some(&key), result.message_id).await.unwrap();

    let after_ack = h.inbox.get_inbox(&address, Some(&key)).await.unwrap();
    assert!(after_ack.is_empty());

    let second_ack = h.inbox.acknowledge_message(&address, Some(&key), result.message_id).await;
    assert!(matches!(
        second_ack,
        Err(amtp_gateway::inbox::InboxError::AlreadyAcknowledged)
    ));
}
