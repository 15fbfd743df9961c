//! Reliable batch publisher integration tests.

mod common;

use channel_engine::config::{ConsumerConfig, PublisherConfig};
use channel_engine::transport::{InMemoryTransport, RecordOutcome};
use channel_engine::{
    ChannelError, ChannelPosition, ConsumptionEngine, Message, MessageDispatcher, PublishReport,
    ReliableBatchPublisher, StopCondition,
};
use common::{json_message, RecordingConsumer, ScriptedTransport};
use serde_json::json;
use std::sync::Arc;

fn batch(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| json_message(&format!("k{}", i), json!({ "i": i })))
        .collect()
}

async fn scripted_log(channel: &str, max_batch_size: usize) -> Arc<ScriptedTransport> {
    let inner = Arc::new(InMemoryTransport::with_max_batch_size(max_batch_size));
    inner.create_log(channel, 1).await;
    Arc::new(ScriptedTransport::new(inner))
}

fn publisher(transport: Arc<ScriptedTransport>) -> ReliableBatchPublisher {
    ReliableBatchPublisher::new(transport).with_config(PublisherConfig::for_testing())
}

#[tokio::test]
async fn test_partial_failure_resubmits_only_failed_records() {
    let transport = scripted_log("orders", 500).await;
    let throttled = RecordOutcome::retryable("ProvisionedThroughputExceeded", "slow down");
    transport.fail_key("k3", throttled.clone(), 1);
    transport.fail_key("k7", throttled, 1);

    let report = publisher(transport.clone())
        .publish("orders", batch(10))
        .await
        .unwrap();

    assert_eq!(
        report,
        PublishReport {
            records: 10,
            sub_batches: 1,
            attempts: 2
        }
    );
    let calls = transport.put_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].len(), 10);
    assert_eq!(calls[1], vec!["k3".to_string(), "k7".to_string()]);
    assert_eq!(transport.inner().record_count("orders").await, 10);
}

#[tokio::test]
async fn test_resubmitted_records_keep_key_and_payload() {
    let transport = scripted_log("orders", 500).await;
    transport.fail_key("k1", RecordOutcome::retryable("Throttled", "retry"), 2);

    publisher(transport.clone())
        .publish("orders", batch(3))
        .await
        .unwrap();

    let consumer = Arc::new(RecordingConsumer::new("reader"));
    let engine = ConsumptionEngine::new(
        "orders",
        transport.inner().clone(),
        MessageDispatcher::new().with(consumer.clone()),
    )
    .with_config(ConsumerConfig::for_testing());
    engine
        .consume_until(ChannelPosition::new(), StopCondition::end_of_channel())
        .await
        .unwrap();

    let delivered = consumer.delivered();
    assert_eq!(consumer.keys(), vec!["k0", "k2", "k1"]);
    let k1 = delivered.iter().find(|d| d.key == "k1").unwrap();
    assert_eq!(k1.payload, Some(json!({ "i": 1 })));
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried() {
    let transport = scripted_log("orders", 500).await;
    transport.fail_key(
        "k4",
        RecordOutcome::terminal("ValidationException", "bad record"),
        usize::MAX,
    );

    let err = publisher(transport.clone())
        .publish("orders", batch(6))
        .await
        .unwrap_err();

    match err {
        ChannelError::TerminalPublish { key, code, .. } => {
            assert_eq!(key, "k4");
            assert_eq!(code, "ValidationException");
        }
        other => panic!("expected terminal publish error, got {other:?}"),
    }
    assert_eq!(transport.put_calls().len(), 1);
    assert!(!ChannelError::TerminalPublish {
        channel: "orders".into(),
        key: "k4".into(),
        code: "x".into(),
        message: "y".into(),
    }
    .is_retryable());
}

#[tokio::test]
async fn test_exhausted_retries_report_residual_failures() {
    let transport = scripted_log("orders", 500).await;
    transport.fail_key("k2", RecordOutcome::retryable("Throttled", "retry"), usize::MAX);

    let err = ReliableBatchPublisher::new(transport.clone())
        .with_config(PublisherConfig {
            max_attempts: 3,
            ..PublisherConfig::for_testing()
        })
        .publish("orders", batch(5))
        .await
        .unwrap_err();

    match err {
        ChannelError::PublishExhausted {
            sub_batch,
            remaining,
            attempts,
            ..
        } => {
            assert_eq!(sub_batch, 0);
            assert_eq!(remaining, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted publish error, got {other:?}"),
    }

    let calls = transport.put_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1], vec!["k2".to_string()]);
    assert_eq!(calls[2], vec!["k2".to_string()]);
    // Everything except k2 was stored once
    assert_eq!(transport.inner().record_count("orders").await, 4);
}

#[tokio::test]
async fn test_earlier_sub_batches_stay_published_after_failure() {
    let transport = scripted_log("orders", 4).await;
    transport.fail_key("k5", RecordOutcome::terminal("ValidationException", "bad"), 1);

    let err = publisher(transport.clone())
        .publish("orders", batch(10))
        .await
        .unwrap_err();

    assert!(matches!(err, ChannelError::TerminalPublish { .. }));
    let calls = transport.put_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec!["k0", "k1", "k2", "k3"]);
    // First sub-batch plus the accepted records of the second
    assert_eq!(transport.inner().record_count("orders").await, 7);
}
