use super::*;
use crate::config::{LeadflowConfig, RateLimitConfig};
use crate::crm::transport::MockTransport;
use crate::crm::types::{ContactFields, ContactPayload, ContactUpdate, TagEntry};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn test_config() -> LeadflowConfig {
    let mut config = LeadflowConfig::default();
    config.crm.api_token = "test-token".to_string();
    config.crm.location_id = "loc-test".to_string();
    config.batch.accumulation_window = Duration::from_millis(50);
    config.batch.batch_size = 5;
    config
}

fn mock_client(config: LeadflowConfig) -> (BatchClient, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let client = BatchClient::with_transport(config, transport.clone());
    (client, transport)
}

fn contact(email: &str) -> ContactPayload {
    ContactPayload {
        email: Some(email.to_string()),
        ..Default::default()
    }
}

fn tag_request(contact_id: &str, tag: &str) -> BatchRequest {
    BatchRequest::new(
        OperationKind::TagAdd,
        Some(contact_id.to_string()),
        RequestPayload::Tags(vec![tag.to_string()]),
    )
    .unwrap()
}

fn bulk_response(n: usize) -> serde_json::Value {
    let contacts: Vec<_> = (0..n).map(|i| json!({ "id": format!("c{}", i) })).collect();
    json!({ "contacts": contacts })
}

#[test]
fn dedup_key_is_stable_across_field_order() {
    let a = tag_request("c1", "lead");
    let mut b = a.clone();
    // Different id and timestamp, same semantic content.
    b.id = uuid::Uuid::now_v7();
    assert_eq!(dedup_key(&a), dedup_key(&b));

    let other = tag_request("c2", "lead");
    assert_ne!(dedup_key(&a), dedup_key(&other));
}

#[test]
fn request_validation_rejects_bad_shapes() {
    // Create without any contact info.
    let err = BatchRequest::new(
        OperationKind::ContactCreate,
        None,
        RequestPayload::Contact(ContactPayload::default()),
    )
    .unwrap_err();
    assert!(matches!(err, BatchError::InvalidPayload(_)));

    // Update without a target id.
    let err = BatchRequest::new(
        OperationKind::ContactUpdate,
        None,
        RequestPayload::ContactFields(ContactFields {
            email: Some("x@y.z".to_string()),
            ..Default::default()
        }),
    )
    .unwrap_err();
    assert!(matches!(err, BatchError::InvalidPayload(_)));

    // Empty tag list.
    let err = BatchRequest::new(
        OperationKind::TagAdd,
        Some("c1".to_string()),
        RequestPayload::Tags(vec![]),
    )
    .unwrap_err();
    assert!(matches!(err, BatchError::InvalidPayload(_)));

    // Payload variant that does not match the operation.
    let err = BatchRequest::new(
        OperationKind::TagAdd,
        Some("c1".to_string()),
        RequestPayload::Contact(contact("x@y.z")),
    )
    .unwrap_err();
    assert!(matches!(err, BatchError::InvalidPayload(_)));
}

#[test]
fn metrics_reset_zeroes_everything() {
    let metrics = MetricsCollector::new();
    metrics.record_submitted();
    metrics.record_deduplicated();
    metrics.record_batch(&[BatchResult::ok(
        uuid::Uuid::now_v7(),
        json!({}),
        Duration::from_millis(10),
    )]);
    assert_eq!(metrics.snapshot().total_requests, 1);
    assert_eq!(metrics.snapshot().batched_requests, 1);

    metrics.reset();
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_requests, 0);
    assert_eq!(snapshot.batched_requests, 0);
    assert_eq!(snapshot.successful_requests, 0);
    assert_eq!(snapshot.average_latency_ms, 0.0);
}

#[test]
fn metrics_snapshot_derives_rates() {
    let metrics = MetricsCollector::new();
    for _ in 0..4 {
        metrics.record_submitted();
    }
    metrics.record_batch(&[
        BatchResult::ok(uuid::Uuid::now_v7(), json!({}), Duration::from_millis(30)),
        BatchResult::ok(uuid::Uuid::now_v7(), json!({}), Duration::from_millis(10)),
        BatchResult::err(
            uuid::Uuid::now_v7(),
            BatchError::ChannelClosed,
            Duration::from_millis(20),
        ),
    ]);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.batched_requests, 3);
    assert_eq!(snapshot.successful_requests, 2);
    assert_eq!(snapshot.failed_requests, 1);
    assert!((snapshot.average_latency_ms - 20.0).abs() < f64::EPSILON);
    assert!((snapshot.success_rate_percent - 66.666).abs() < 0.01);
    assert!((snapshot.batch_efficiency_percent - 75.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn limiter_admits_up_to_ceiling_then_delays() {
    let limiter = SlidingWindowLimiter::new(RateLimitConfig {
        max_requests: 2,
        window: Duration::from_secs(60),
        margin: Duration::from_millis(100),
    });

    assert_eq!(limiter.acquire().await, Duration::ZERO);
    assert_eq!(limiter.acquire().await, Duration::ZERO);
    assert_eq!(limiter.available().await, 0);

    let before = Instant::now();
    let waited = limiter.acquire().await;
    assert!(waited >= Duration::from_secs(60));
    assert!(before.elapsed() >= Duration::from_secs(60));
    // The oldest slot aged out, so one more is immediate.
    assert_eq!(limiter.acquire().await, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn dedup_index_expires_entries() {
    let mut index = DedupIndex::new();
    let request = tag_request("c1", "hot");
    let window = Duration::from_secs(30);

    assert!(index.duplicate_of(&request, window).is_none());
    index.register(&request);
    assert_eq!(index.duplicate_of(&request, window), Some(request.id));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(index.duplicate_of(&request, window).is_none());
}

#[tokio::test(start_paused = true)]
async fn rejected_request_registers_no_dedup_key() {
    let queue = PendingQueue::new(1, Duration::from_secs(30));

    let (tx, _rx) = tokio::sync::oneshot::channel();
    assert!(matches!(
        queue.enqueue(tag_request("c1", "a"), tx).await,
        queue::Enqueued::Queued
    ));

    let (tx, _rx) = tokio::sync::oneshot::channel();
    assert!(matches!(
        queue.enqueue(tag_request("c2", "b"), tx).await,
        queue::Enqueued::Rejected { .. }
    ));

    // The index only tracks requests that actually made it into a
    // bucket; the rejected one left no entry behind.
    assert_eq!(queue.depth().await, 1);
    assert_eq!(queue.dedup_entries().await, 1);
}

#[tokio::test(start_paused = true)]
async fn seven_distinct_tag_adds_yield_seven_results() {
    let (client, transport) = mock_client(test_config());

    let entries: Vec<TagEntry> = (0..7)
        .map(|i| TagEntry {
            id: format!("c{}", i),
            tags: vec!["lead".to_string()],
        })
        .collect();
    let results = client.add_tags_batch(entries).await.unwrap();

    assert_eq!(results.len(), 7);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(transport.call_count(Method::POST, "/contacts/"), 7);

    let metrics = client.get_metrics();
    assert_eq!(metrics.total_requests, 7);
    assert_eq!(metrics.batched_requests, 7);
    assert_eq!(metrics.successful_requests, 7);
    assert_eq!(metrics.deduplicated_requests, 0);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn contact_creates_go_through_bulk_upsert_in_chunks() {
    let (client, transport) = mock_client(test_config());
    // 7 contacts with batch size 5: one call of 5, one of 2.
    transport.on(Method::POST, "/contacts/bulk-upsert", bulk_response(5));
    transport.on(Method::POST, "/contacts/bulk-upsert", bulk_response(2));

    let contacts: Vec<_> = (0..7).map(|i| contact(&format!("p{}@x.io", i))).collect();
    let results = client.create_contacts_batch(contacts).await.unwrap();

    assert_eq!(results.len(), 7);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(transport.call_count(Method::POST, "/contacts/bulk-upsert"), 2);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_is_coalesced_and_both_callers_resolve() {
    let (client, transport) = mock_client(test_config());

    let a = tag_request("c1", "vip");
    let b = tag_request("c1", "vip");
    let (a_id, b_id) = (a.id, b.id);
    assert_ne!(a_id, b_id);

    let handles = client.submit(vec![a, b]).await;
    assert_eq!(handles.len(), 2);
    assert!(!handles[0].deduplicated());
    assert!(handles[1].deduplicated());

    let results =
        futures::future::join_all(handles.into_iter().map(PendingHandle::wait)).await;
    assert!(results.iter().all(|r| r.success));
    // Each caller sees its own request id on the shared outcome.
    assert_eq!(results[0].request_id, a_id);
    assert_eq!(results[1].request_id, b_id);

    let metrics = client.get_metrics();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.deduplicated_requests, 1);
    assert_eq!(metrics.batched_requests, 1);
    // The coalesced pair produced exactly one network call.
    assert_eq!(transport.call_count(Method::POST, "/contacts/"), 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_ceiling_delays_chunk_execution() {
    let mut config = test_config();
    config.rate_limit.max_requests = 2;
    config.rate_limit.window = Duration::from_secs(60);
    let (client, _transport) = mock_client(config);

    let entries: Vec<TagEntry> = (0..3)
        .map(|i| TagEntry {
            id: format!("c{}", i),
            tags: vec!["lead".to_string()],
        })
        .collect();
    let started = Instant::now();
    let handles = client.submit(
        entries
            .into_iter()
            .map(|e| {
                BatchRequest::new(
                    OperationKind::TagAdd,
                    Some(e.id),
                    RequestPayload::Tags(e.tags),
                )
                .unwrap()
            })
            .collect(),
    )
    .await;
    let results = futures::future::join_all(
        handles.into_iter().map(|h| h.wait_for(Duration::from_secs(120))),
    )
    .await;

    assert!(results.iter().all(|r| r.success));
    // The third call had to wait for a window slot.
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(client.get_metrics().rate_limit_violations >= 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reported_latency_excludes_throttle_wait() {
    let mut config = test_config();
    config.rate_limit.max_requests = 1;
    config.rate_limit.window = Duration::from_secs(60);
    let (client, _transport) = mock_client(config);

    let handles = client
        .submit(vec![tag_request("c1", "a"), tag_request("c2", "b")])
        .await;
    let results = futures::future::join_all(
        handles
            .into_iter()
            .map(|h| h.wait_for(Duration::from_secs(120))),
    )
    .await;

    assert!(results.iter().all(|r| r.success));
    // The second call slept ~60s for a slot, but latency tracks only
    // the provider round trip, which the mock answers instantly.
    assert!(results.iter().all(|r| r.latency < Duration::from_secs(1)));
    assert!(client.get_metrics().average_latency_ms < 1000.0);
    assert!(client.get_metrics().rate_limit_violations >= 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bulk_cardinality_mismatch_fails_unmapped_items() {
    let (client, transport) = mock_client(test_config());
    transport.on(Method::POST, "/contacts/bulk-upsert", bulk_response(2));

    let contacts: Vec<_> = (0..3).map(|i| contact(&format!("q{}@x.io", i))).collect();
    let results = client.create_contacts_batch(contacts).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert!(results[1].success);
    assert!(!results[2].success);
    assert_eq!(
        results[2].error,
        Some(BatchError::ResponseMapping { expected: 3, got: 2 })
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn per_item_failures_do_not_poison_siblings() {
    let (client, transport) = mock_client(test_config());
    transport.fail(Method::PUT, "/contacts/bad", 422, "invalid phone");

    let updates = vec![
        ContactUpdate {
            id: "good-1".to_string(),
            fields: ContactFields {
                first_name: Some("Ada".to_string()),
                ..Default::default()
            },
        },
        ContactUpdate {
            id: "bad".to_string(),
            fields: ContactFields {
                phone: Some("nope".to_string()),
                ..Default::default()
            },
        },
        ContactUpdate {
            id: "good-2".to_string(),
            fields: ContactFields {
                last_name: Some("Lovelace".to_string()),
                ..Default::default()
            },
        },
    ];
    let results = client.update_contacts_batch(updates).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(matches!(
        results[1].error,
        Some(BatchError::Crm(crate::crm::types::CrmError::Provider { status: 422, .. }))
    ));
    assert!(results[2].success);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bulk_transport_failure_fails_every_item_in_chunk() {
    let (client, transport) = mock_client(test_config());
    transport.fail_network(Method::POST, "/contacts/bulk-upsert", "connection reset");

    let contacts: Vec<_> = (0..2).map(|i| contact(&format!("r{}@x.io", i))).collect();
    let results = client.create_contacts_batch(contacts).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.success));
    assert!(results.iter().all(|r| matches!(
        r.error,
        Some(BatchError::Crm(crate::crm::types::CrmError::Network(_)))
    )));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_immediately() {
    let mut config = test_config();
    config.batch.max_pending = 1;
    let (client, _transport) = mock_client(config);

    let handles = client
        .submit(vec![tag_request("c1", "a"), tag_request("c2", "b")])
        .await;
    assert_eq!(handles.len(), 2);

    let mut iter = handles.into_iter();
    let first = iter.next().unwrap();
    let second = iter.next().unwrap();

    // The rejection resolves without waiting for a window.
    let rejected = second.wait_for(Duration::from_millis(1)).await;
    assert!(!rejected.success);
    assert_eq!(rejected.error, Some(BatchError::QueueFull { depth: 1 }));

    let accepted = first.wait().await;
    assert!(accepted.success);
    assert!(client.get_metrics().failed_requests >= 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn wait_for_times_out_when_no_window_fires() {
    let mut config = test_config();
    config.batch.accumulation_window = Duration::from_secs(600);
    let (client, _transport) = mock_client(config);

    let mut handles = client.submit(vec![tag_request("c1", "slow")]).await;
    let result = handles
        .pop()
        .unwrap()
        .wait_for(Duration::from_secs(1))
        .await;
    assert!(!result.success);
    assert_eq!(
        result.error,
        Some(BatchError::TimeoutWaitingForBatch(Duration::from_secs(1)))
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_pending_requests() {
    let mut config = test_config();
    // Window far in the future: only the shutdown drain can run these.
    config.batch.accumulation_window = Duration::from_secs(600);
    let (client, transport) = mock_client(config);

    let handles = client
        .submit(vec![tag_request("c1", "x"), tag_request("c2", "y")])
        .await;
    client.shutdown().await;

    let results =
        futures::future::join_all(handles.into_iter().map(PendingHandle::wait)).await;
    assert!(results.iter().all(|r| r.success));
    assert_eq!(transport.call_count(Method::POST, "/contacts/"), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_executor_resolves_with_unsupported_operation() {
    let config = test_config();
    let metrics = Arc::new(MetricsCollector::new());
    let queue = PendingQueue::new(config.batch.max_pending, config.batch.dedup_window);
    let handle = BatchProcessor::new(
        queue.clone(),
        Arc::new(ExecutorRegistry::empty()),
        Arc::clone(&metrics),
        config.batch.clone(),
    )
    .spawn();

    let request = tag_request("c1", "orphan");
    let request_id = request.id;
    let (tx, rx) = tokio::sync::oneshot::channel();
    assert!(matches!(
        queue.enqueue(request, tx).await,
        queue::Enqueued::Queued
    ));

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.request_id, request_id);
    assert_eq!(
        result.error,
        Some(BatchError::UnsupportedOperation(OperationKind::TagAdd))
    );
    assert_eq!(metrics.snapshot().failed_requests, 1);
    handle.stop(config.batch.shutdown_grace).await;
}
