//! Benchmarks for the Message Processor's fan-out path: idempotency gate, dispatch by
//! coordination mode, and the aggregate-then-persist step, independent of real network I/O.

use amtp_gateway::delivery::{DeliveryEngine, DeliveryResult};
use amtp_gateway::domain_types::{Address, IdempotencyKey, StorageCapacity};
use amtp_gateway::model::{CoordinationConfig, DeliveryMode, DeliveryStatus, Message};
use amtp_gateway::processor::{MessageProcessor, ProcessingOptions};
use amtp_gateway::storage::InMemoryStorage;
use async_trait::async_trait;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// Delivers everything instantly as if every recipient were a registered local pull agent,
/// so the benchmark isolates the processor's own dispatch and aggregation overhead.
struct InstantDelivery;

#[async_trait]
impl DeliveryEngine for InstantDelivery {
    async fn deliver_message(
        &self,
        _cancellation: &CancellationToken,
        _message: &Message,
        _recipient_addr: &Address,
    ) -> DeliveryResult {
        delivered()
    }

    async fn deliver_batch(
        &self,
        _cancellation: &CancellationToken,
        _message: &Message,
        recipients: &[Address],
    ) -> HashMap<Address, DeliveryResult> {
        recipients.iter().map(|r| (r.clone(), delivered())).collect()
    }
}

fn delivered() -> DeliveryResult {
    DeliveryResult {
        status: DeliveryStatus::Delivered,
        http_status: Some(200),
        error_code: None,
        error_message: None,
        timestamp: Utc::now(),
        attempt_count: 1,
        delivery_mode: DeliveryMode::Pull,
        local_delivery: true,
    }
}

fn make_message(recipient_count: usize, coordination: Option<CoordinationConfig>) -> Message {
    let recipients: Vec<Address> = (0..recipient_count)
        .map(|i| Address::try_new(format!("agent{i}@example.com")).unwrap())
        .collect();
    Message::accept(
        IdempotencyKey::generate(),
        Address::try_new("sender@example.com").unwrap(),
        recipients,
        None,
        None,
        HashMap::new(),
        b"payload".to_vec(),
        coordination,
    )
    .unwrap()
}

fn bench_parallel_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("processor_parallel_fanout");

    for recipient_count in [1, 10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("process_message", recipient_count),
            recipient_count,
            |b, &recipient_count| {
                b.to_async(&rt).iter(|| async {
                    let storage = Arc::new(InMemoryStorage::new(StorageCapacity::try_new(100_000).unwrap()));
                    let delivery = Arc::new(InstantDelivery);
                    let processor = MessageProcessor::new(storage, delivery);

                    let message = make_message(recipient_count, None);
                    let result = processor.process_message(message, ProcessingOptions::default()).await;
                    black_box(result).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_sequential_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("processor_sequential_fanout");

    for recipient_count in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("process_message", recipient_count),
            recipient_count,
            |b, &recipient_count| {
                b.to_async(&rt).iter(|| async {
                    let storage = Arc::new(InMemoryStorage::new(StorageCapacity::try_new(100_000).unwrap()));
                    let delivery = Arc::new(InstantDelivery);
                    let processor = MessageProcessor::new(storage, delivery);

                    let sequence: Vec<Address> = (0..recipient_count)
                        .map(|i| Address::try_new(format!("agent{i}@example.com")).unwrap())
                        .collect();
                    let coordination = CoordinationConfig::sequential(sequence, false).unwrap();
                    let message = make_message(recipient_count, Some(coordination));
                    let result = processor.process_message(message, ProcessingOptions::default()).await;
                    black_box(result).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_idempotent_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("processor_idempotent_replay");

    group.bench_function("cache_hit", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let storage = Arc::new(InMemoryStorage::new(StorageCapacity::try_new(1_000).unwrap()));
                let delivery = Arc::new(InstantDelivery);
                let processor = MessageProcessor::new(storage, delivery);
                let key = IdempotencyKey::generate();
                let message = Message::accept(
                    key,
                    Address::try_new("sender@example.com").unwrap(),
                    vec![Address::try_new("bob@example.com").unwrap()],
                    None,
                    None,
                    HashMap::new(),
                    b"payload".to_vec(),
                    None,
                )
                .unwrap();
                (processor, message, key)
            },
            |(processor, message, key)| async move {
                processor.process_message(message.clone(), ProcessingOptions::default()).await.unwrap();
                let replay = Message::accept(
                    key,
                    Address::try_new("sender@example.com").unwrap(),
                    vec![Address::try_new("bob@example.com").unwrap()],
                    None,
                    None,
                    HashMap::new(),
                    b"payload".to_vec(),
                    None,
                )
                .unwrap();
                let result = processor.process_message(replay, ProcessingOptions::default()).await;
                black_box(result).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_parallel_fanout, bench_sequential_fanout, bench_idempotent_replay);
criterion_main!(benches);
