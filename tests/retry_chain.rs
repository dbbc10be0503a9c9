//! End-to-end retry chains against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use detour::bus::{InMemoryBroker, OutgoingRecord, RecordPublisher, Transport};
use async_trait::async_trait;
use detour::dlt::{ChannelDltHandler, DeadLetter, DltError, DltHandler, DltStrategy};
use detour::failure::kinds;
use detour::headers::{self, RetryState};
use detour::listener::{ContainerHandle, DispatcherConfig};
use detour::utils::now_millis;
use detour::utils::retry::PublishRetryConfig;
use detour::{
    handler_fn, ListenerFailure, RecordHandler, RetryEndpoint, RetryTopicConfiguration,
    RetryTopicContainer, RetryTopicRegistry, TerminalReason,
};

const GROUP: &str = "orders-service";

fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_timeout_ms: 20,
        redelivery_initial_ms: 20,
        redelivery_max_ms: 100,
        ..Default::default()
    }
}

async fn start(
    broker: &InMemoryBroker,
    configuration: RetryTopicConfiguration,
    handler: Arc<dyn RecordHandler>,
) -> ContainerHandle {
    start_with(broker, configuration, handler, dispatcher_config()).await
}

async fn start_with(
    broker: &InMemoryBroker,
    configuration: RetryTopicConfiguration,
    handler: Arc<dyn RecordHandler>,
    dispatcher: DispatcherConfig,
) -> ContainerHandle {
    start_endpoint(broker, configuration, orders_endpoint(handler), dispatcher).await
}

async fn start_endpoint(
    broker: &InMemoryBroker,
    configuration: RetryTopicConfiguration,
    endpoint: RetryEndpoint,
    dispatcher: DispatcherConfig,
) -> ContainerHandle {
    let mut registry = RetryTopicRegistry::new();
    registry.register(configuration);

    let mut container = RetryTopicContainer::new(
        registry,
        Transport::in_memory(broker.clone()),
        dispatcher,
    );
    container.add_endpoint(endpoint).unwrap();
    container.start().await.unwrap()
}

fn orders_endpoint(handler: Arc<dyn RecordHandler>) -> RetryEndpoint {
    RetryEndpoint::new("orders-listener", GROUP, vec!["orders".to_string()], handler)
}

/// Dead-letter handler that always fails, counting its calls.
struct RejectingDltHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DltHandler for RejectingDltHandler {
    async fn handle(&self, _dead_letter: DeadLetter) -> Result<(), DltError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DltError::HandlerFailed("archive unavailable".to_string()))
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler that fails every call with `kind`, recording topic and time.
fn failing_handler(kind: &'static str) -> (Arc<dyn RecordHandler>, Arc<Mutex<Vec<(String, i64)>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    let handler = handler_fn(move |record| {
        seen.lock().unwrap().push((record.topic.clone(), now_millis()));
        async move { Err(ListenerFailure::new(kind, "order service unavailable")) }
    });
    (handler, calls)
}

async fn publish_order(broker: &InMemoryBroker) {
    broker
        .publish(OutgoingRecord::new("orders", "order-1").with_key("customer-7"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_orders_record_walks_chain_to_dlt() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(100)
        .max_attempts(3)
        .build()
        .unwrap();
    let (handler, calls) = failing_handler("TimeoutError");
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("dead letter", || broker.records("orders-dlt").len() == 1).await;
    handle.stop().await;

    let calls = calls.lock().unwrap().clone();
    let topics: Vec<&str> = calls.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(topics, vec!["orders", "orders-retry-0", "orders-retry-1"]);
    assert!(calls[1].1 - calls[0].1 >= 100, "retry-0 ran before its delay");
    assert!(calls[2].1 - calls[1].1 >= 100, "retry-1 ran before its delay");

    assert_eq!(broker.records("orders-retry-0").len(), 1);
    assert_eq!(broker.records("orders-retry-1").len(), 1);

    let dead = &broker.records("orders-dlt")[0];
    let state = RetryState::from_headers(&dead.headers).unwrap().unwrap();
    assert_eq!(state.attempts, 3);
    assert_eq!(state.original_topic, "orders");
    assert_eq!(state.original_offset, 0);
    assert_eq!(state.exception_kind.as_deref(), Some("TimeoutError"));
    assert_eq!(dead.key.as_deref(), Some(&b"customer-7"[..]));
    assert_eq!(dead.payload.as_deref(), Some(&b"order-1"[..]));

    assert_eq!(broker.committed_offset(GROUP, "orders", 0), 1);
    assert_eq!(broker.committed_offset("orders-service-retry-1", "orders-retry-1", 0), 1);
}

#[tokio::test]
async fn test_fatal_failure_skips_retries() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(50)
        .max_attempts(4)
        .build()
        .unwrap();
    let (handler, calls) = failing_handler(kinds::DESERIALIZATION);
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("dead letter", || broker.records("orders-dlt").len() == 1).await;
    handle.stop().await;

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(broker.records("orders-retry-0").is_empty());
    let dead = &broker.records("orders-dlt")[0];
    assert_eq!(dead.headers.get_str(headers::ATTEMPTS), Some("1"));
    assert_eq!(
        dead.headers.get_str(headers::EXCEPTION_KIND),
        Some(kinds::DESERIALIZATION)
    );
}

#[tokio::test]
async fn test_routed_dead_letter_topic() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(2)
        .dlt_routing("-validation", ["ValidationError"])
        .build()
        .unwrap();
    let (handler, _) = failing_handler("ValidationError");
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("routed dead letter", || {
        broker.records("orders-validation-dlt").len() == 1
    })
    .await;
    handle.stop().await;

    assert!(broker.records("orders-dlt").is_empty());
    assert_eq!(broker.records("orders-retry-0").len(), 1);
}

#[tokio::test]
async fn test_dlt_handler_receives_terminal_record() {
    let broker = InMemoryBroker::new();
    let (dlt_handler, mut dead_letters) = ChannelDltHandler::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(2)
        .dlt_handler(Arc::new(dlt_handler))
        .build()
        .unwrap();
    let (handler, _) = failing_handler("TimeoutError");
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    let letter = tokio::time::timeout(Duration::from_secs(5), dead_letters.recv())
        .await
        .unwrap()
        .unwrap();
    handle.stop().await;

    assert_eq!(letter.reason, TerminalReason::AttemptsExhausted);
    assert_eq!(letter.attempts(), 2);
    assert_eq!(letter.original_topic(), "orders");
    assert_eq!(letter.destination_topic, "orders-dlt");
    assert_eq!(letter.failure.kind(), "TimeoutError");
    assert!(broker.records("orders-dlt").is_empty());
}

#[tokio::test]
async fn test_recovered_record_stops_on_retry_stage() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(30)
        .max_attempts(3)
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = handler_fn(move |_record| {
        let call = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                Err(ListenerFailure::new("TimeoutError", "first try fails"))
            } else {
                Ok(())
            }
        }
    });
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("retry-0 commit", || {
        broker.committed_offset("orders-service-retry-0", "orders-retry-0", 0) == 1
    })
    .await;
    handle.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(broker.records("orders-retry-1").is_empty());
    assert!(broker.records("orders-dlt").is_empty());
}

#[tokio::test]
async fn test_main_topic_keeps_flowing_while_retry_waits() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(60_000)
        .max_attempts(2)
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = handler_fn(move |record| {
        seen.fetch_add(1, Ordering::SeqCst);
        let fail = record.payload.as_deref() == Some(&b"bad"[..]);
        async move {
            if fail {
                Err(ListenerFailure::new("TimeoutError", "bad order"))
            } else {
                Ok(())
            }
        }
    });
    let handle = start(&broker, configuration, handler).await;

    broker.publish(OutgoingRecord::new("orders", "bad")).await.unwrap();
    broker.publish(OutgoingRecord::new("orders", "good")).await.unwrap();

    eventually("main topic drained", || {
        broker.committed_offset(GROUP, "orders", 0) == 2
    })
    .await;
    handle.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.records("orders-retry-0").len(), 1);
}

#[tokio::test]
async fn test_shutdown_during_delay_leaves_record_uncommitted() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(60_000)
        .max_attempts(2)
        .build()
        .unwrap();
    let (handler, calls) = failing_handler("TimeoutError");
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("retry record", || broker.records("orders-retry-0").len() == 1).await;
    // Give the retry worker time to pick the record up and start waiting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await;
    assert!(stopped.is_ok(), "stop did not interrupt the wait");

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(
        broker.committed_offset("orders-service-retry-0", "orders-retry-0", 0),
        0
    );
}

#[tokio::test]
async fn test_record_without_retry_headers_is_dead_lettered() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(3)
        .build()
        .unwrap();
    let (handler, calls) = failing_handler("TimeoutError");
    let handle = start(&broker, configuration, handler).await;

    broker
        .publish(OutgoingRecord::new("orders-retry-0", "stray"))
        .await
        .unwrap();
    eventually("dead letter", || broker.records("orders-dlt").len() == 1).await;
    handle.stop().await;

    assert!(calls.lock().unwrap().is_empty());
    let dead = &broker.records("orders-dlt")[0];
    assert_eq!(
        dead.headers.get_str(headers::EXCEPTION_KIND),
        Some(kinds::MISSING_RETRY_HEADERS)
    );
    assert_eq!(dead.headers.get_str(headers::ORIGINAL_TOPIC), Some("orders"));
}

#[tokio::test]
async fn test_unpublishable_record_is_redelivered() {
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(2)
        .build()
        .unwrap();
    let (handler, calls) = failing_handler("TimeoutError");

    publish_order(&broker).await;
    // Three republish attempts fail the first dispatch, one more fails the second.
    broker.fail_next_publishes(4);
    let dispatcher = DispatcherConfig {
        publish_retry: PublishRetryConfig {
            min_delay_ms: 5,
            max_delay_ms: 20,
            max_times: 2,
        },
        ..dispatcher_config()
    };
    let handle = start_with(&broker, configuration, handler, dispatcher).await;

    eventually("retry record", || broker.records("orders-retry-0").len() == 1).await;
    eventually("main commit", || broker.committed_offset(GROUP, "orders", 0) == 1).await;
    handle.stop().await;

    let calls = calls.lock().unwrap().clone();
    let on_main = calls.iter().filter(|(t, _)| t == "orders").count();
    assert_eq!(on_main, 2);
}

async fn run_with_rejecting_dlt_handler(strategy: DltStrategy) -> (InMemoryBroker, usize) {
    let broker = InMemoryBroker::new();
    let dlt_calls = Arc::new(AtomicUsize::new(0));
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .no_backoff()
        .max_attempts(1)
        .dlt_handler(Arc::new(RejectingDltHandler {
            calls: Arc::clone(&dlt_calls),
        }))
        .dlt_strategy(strategy)
        .build()
        .unwrap();
    let (handler, _) = failing_handler("TimeoutError");
    let handle = start(&broker, configuration, handler).await;

    publish_order(&broker).await;
    eventually("main commit", || broker.committed_offset(GROUP, "orders", 0) == 1).await;
    handle.stop().await;

    let calls = dlt_calls.load(Ordering::SeqCst);
    (broker, calls)
}

#[tokio::test]
async fn test_fail_on_error_acknowledges_when_dlt_handler_fails() {
    let (broker, dlt_calls) = run_with_rejecting_dlt_handler(DltStrategy::FailOnError).await;

    assert_eq!(dlt_calls, 1);
    assert!(broker.records("orders-dlt").is_empty());
}

#[tokio::test]
async fn test_always_retry_on_error_publishes_when_dlt_handler_fails() {
    let (broker, dlt_calls) =
        run_with_rejecting_dlt_handler(DltStrategy::AlwaysRetryOnError).await;

    assert_eq!(dlt_calls, 1);
    let dead = broker.records("orders-dlt");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.as_deref(), Some(&b"order-1"[..]));
}

#[tokio::test]
async fn test_worker_count_follows_stage_concurrency() {
    let (handler, _) = failing_handler("TimeoutError");

    // Retry stages take the configuration's concurrency over the endpoint's.
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(3)
        .concurrency(2)
        .build()
        .unwrap();
    let endpoint = orders_endpoint(Arc::clone(&handler)).with_concurrency(3);
    let handle = start_endpoint(&broker, configuration, endpoint, dispatcher_config()).await;
    assert_eq!(handle.worker_count(), 3 + 2 + 2);
    handle.stop().await;

    // Without a configuration value every stage takes the endpoint's.
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(3)
        .build()
        .unwrap();
    let endpoint = orders_endpoint(Arc::clone(&handler)).with_concurrency(3);
    let handle = start_endpoint(&broker, configuration, endpoint, dispatcher_config()).await;
    assert_eq!(handle.worker_count(), 3 * 3);
    handle.stop().await;

    // Main stage ignores the configuration value and falls back to the default.
    let broker = InMemoryBroker::new();
    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(3)
        .concurrency(4)
        .build()
        .unwrap();
    let dispatcher = DispatcherConfig {
        default_concurrency: 2,
        ..dispatcher_config()
    };
    let handle = start_endpoint(&broker, configuration, orders_endpoint(handler), dispatcher).await;
    assert_eq!(handle.worker_count(), 2 + 4 + 4);
    handle.stop().await;
}

#[tokio::test]
async fn test_concurrent_retry_workers_keep_partition_order() {
    let broker = InMemoryBroker::new();
    broker.create_topic("orders", 2);
    broker.create_topic("orders-retry-0", 2);

    let configuration = RetryTopicConfiguration::builder()
        .include_topic("orders")
        .fixed_backoff(20)
        .max_attempts(2)
        .concurrency(2)
        .build()
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let handler = handler_fn(move |record| {
        let on_retry = record.topic == "orders-retry-0";
        if on_retry {
            recorded.lock().unwrap().push((
                record.partition,
                record.key.clone(),
                record.payload.clone(),
            ));
        }
        async move {
            if on_retry {
                Ok(())
            } else {
                Err(ListenerFailure::new("TimeoutError", "first try fails"))
            }
        }
    });
    let endpoint = orders_endpoint(handler).with_concurrency(2);
    let handle = start_endpoint(&broker, configuration, endpoint, dispatcher_config()).await;

    for n in 0..5 {
        for customer in ["customer-7", "customer-8"] {
            broker
                .publish(OutgoingRecord::new("orders", format!("order-{}", n)).with_key(customer))
                .await
                .unwrap();
        }
    }
    eventually("retries handled", || seen.lock().unwrap().len() == 10).await;
    handle.stop().await;

    let seen = seen.lock().unwrap().clone();
    for customer in ["customer-7", "customer-8"] {
        let records: Vec<_> = seen
            .iter()
            .filter(|(_, key, _)| key.as_deref() == Some(customer.as_bytes()))
            .collect();
        let partitions: std::collections::HashSet<i32> =
            records.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(partitions.len(), 1, "{} spread over partitions", customer);
        let payloads: Vec<String> = records
            .iter()
            .map(|(_, _, payload)| {
                String::from_utf8(payload.as_deref().unwrap_or_default().to_vec()).unwrap()
            })
            .collect();
        let expected: Vec<String> = (0..5).map(|n| format!("order-{}", n)).collect();
        assert_eq!(payloads, expected, "{} out of order", customer);
    }
}
