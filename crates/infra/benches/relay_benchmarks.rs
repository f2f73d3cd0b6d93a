use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use eventrelay_core::AggregateId;
use eventrelay_events::{routing_key, topic_matches, DomainEvent, EventEnvelope, HandlerError};
use eventrelay_infra::idempotency::{handler_fn, IdempotentEventHandlerService};
use eventrelay_infra::processed_events::InMemoryProcessedEventStore;
use eventrelay_observability::NoopMetrics;
use serde_json::{json, Value};

fn payload_with_lines(lines: usize) -> Value {
    let items: Vec<Value> = (0..lines)
        .map(|i| json!({ "sku": format!("SKU-{i:05}"), "quantity": i, "unitPrice": 1999 }))
        .collect();
    json!({ "customerId": "c-42", "currency": "EUR", "lines": items })
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for event_type in ["OrderCreated", "InvoicePaymentReminderScheduled", "SKU"] {
        group.bench_with_input(
            BenchmarkId::new("routing_key", event_type),
            event_type,
            |b, name| b.iter(|| routing_key(black_box(name))),
        );
    }

    group.bench_function("topic_matches_multi_wildcard", |b| {
        b.iter(|| {
            topic_matches(
                black_box("invoice.#.scheduled"),
                black_box("invoice.payment.reminder.scheduled"),
            )
        })
    });

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");

    for lines in [1usize, 10, 100] {
        let event = DomainEvent::new(AggregateId::new(), "OrderCreated", payload_with_lines(lines));
        let body = EventEnvelope::from_event(&event).to_bytes().unwrap();
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", lines), &event, |b, event| {
            b.iter(|| EventEnvelope::from_event(black_box(event)).to_bytes().unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", lines), &body, |b, body| {
            b.iter(|| EventEnvelope::from_slice(black_box(body)).unwrap().into_event())
        });
    }

    group.finish();
}

fn bench_idempotent_handling(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("idempotent_handling");
    group.throughput(Throughput::Elements(1));

    let service = Arc::new(IdempotentEventHandlerService::new(
        Arc::new(InMemoryProcessedEventStore::new()),
        Arc::new(NoopMetrics),
    ));
    service.register_handler(
        "OrderCreated",
        handler_fn(|_event: DomainEvent| async { Ok::<(), HandlerError>(()) }),
    );

    group.bench_function("first_delivery", |b| {
        b.iter(|| {
            let event = DomainEvent::new(AggregateId::new(), "OrderCreated", json!({}));
            runtime.block_on(service.handle_event(&event)).unwrap();
        })
    });

    let duplicate = DomainEvent::new(AggregateId::new(), "OrderCreated", json!({}));
    runtime.block_on(service.handle_event(&duplicate)).unwrap();
    group.bench_function("redelivery_short_circuit", |b| {
        b.iter(|| runtime.block_on(service.handle_event(black_box(&duplicate))).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_routing, bench_envelope, bench_idempotent_handling);
criterion_main!(benches);
