use super::*;
use crate::destination::DestinationType;
use crate::failure::kinds;
use serial_test::serial;
use std::io::Write;

const ORDERS_YAML: &str = r#"
dispatcher:
  poll_timeout_ms: 250
  default_concurrency: 2

fatal_kinds:
  add: [ValidationError]
  remove: [ClassCastError]

retry_topics:
  - name: orders
    include_topics: [orders]
    max_attempts: 4
    backoff:
      kind: exponential
      initial_ms: 1000
      multiplier: 2.0
      max_ms: 10000
    dlt_routing:
      "-validation": [ValidationError]
  - name: payments
    include_topics: ["glob:payments-*"]
    backoff:
      kind: fixed
      interval_ms: 500
    single_topic_for_same_intervals: true
    dlt_strategy: always_retry_on_error

endpoints:
  - id: orders-listener
    group_id: orders-service
    topics: [orders]
"#;

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.dispatcher.poll_timeout_ms, 500);
    assert!(config.retry_topics.is_empty());
    assert!(config.endpoints.is_empty());
}

#[test]
fn test_parse_yaml() {
    let config = Config::from_yaml(ORDERS_YAML).unwrap();

    assert_eq!(config.dispatcher.poll_timeout_ms, 250);
    assert_eq!(config.dispatcher.default_concurrency, 2);
    assert_eq!(config.retry_topics.len(), 2);
    assert_eq!(
        config.retry_topics[0].backoff,
        BackoffSettings::Exponential {
            initial_ms: 1000,
            multiplier: 2.0,
            max_ms: 10_000
        }
    );
    assert_eq!(config.retry_topics[1].dlt_strategy, DltStrategy::AlwaysRetryOnError);
    assert_eq!(config.endpoints[0].group_id, "orders-service");
}

#[test]
fn test_fatal_kind_overrides() {
    let config = Config::from_yaml(ORDERS_YAML).unwrap();
    let fatal = config.fatal_kinds();

    assert!(fatal.contains("ValidationError"));
    assert!(!fatal.contains(kinds::CLASS_CAST));
    assert!(fatal.contains(kinds::DESERIALIZATION));
}

#[test]
fn test_build_registry_from_settings() {
    let config = Config::from_yaml(ORDERS_YAML).unwrap();
    let registry = config.build_registry().unwrap();

    let orders = registry.find_for(&["orders"]).unwrap().unwrap();
    assert_eq!(orders.name(), "orders");
    let names = orders.chain().topic_names("orders");
    assert_eq!(
        names,
        vec![
            "orders",
            "orders-retry-0",
            "orders-retry-1",
            "orders-retry-2",
            "orders-validation-dlt",
            "orders-dlt",
        ]
    );
    let delays: Vec<u64> = orders.chain().stages().iter().map(|s| s.delay_ms).collect();
    assert_eq!(&delays[..4], &[0, 1000, 2000, 4000]);

    let payments = registry.find_for(&["payments-eu"]).unwrap().unwrap();
    assert_eq!(
        payments.chain().stages()[1].destination_type,
        DestinationType::ReusableRetry
    );
    assert_eq!(payments.dlt_strategy(), DltStrategy::AlwaysRetryOnError);
}

#[test]
fn test_invalid_retry_topic_is_named() {
    let yaml = r#"
retry_topics:
  - name: broken
    include_topics: [orders]
    retry_on: [TimeoutError]
    not_retry_on: [ValidationError]
"#;
    let config = Config::from_yaml(yaml).unwrap();

    match config.build_registry() {
        Err(ConfigError::RetryTopic { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("expected retry topic error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_negative_timeout_disables_timeout() {
    let yaml = r#"
retry_topics:
  - name: unbounded
    include_topics: [orders]
    timeout_ms: -1
  - name: bounded
    include_topics: [payments]
    timeout_ms: 30000
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.retry_topics[0].timeout_ms, Some(-1));

    let registry = config.build_registry().unwrap();
    let unbounded = registry.find_for(&["orders"]).unwrap().unwrap();
    assert_eq!(unbounded.timeout_ms(), None);
    let bounded = registry.find_for(&["payments"]).unwrap().unwrap();
    assert_eq!(bounded.timeout_ms(), Some(30_000));
}

#[test]
fn test_unknown_backoff_kind_rejected() {
    let yaml = r#"
retry_topics:
  - include_topics: [orders]
    backoff:
      kind: linear
      step_ms: 10
"#;
    assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
}

#[test]
#[serial]
fn test_load_layers_file_and_environment() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(ORDERS_YAML.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    std::env::set_var("DETOUR__DISPATCHER__POLL_TIMEOUT_MS", "125");
    let loaded = Config::load(Some(&path));
    std::env::remove_var("DETOUR__DISPATCHER__POLL_TIMEOUT_MS");

    let config = loaded.unwrap();
    assert_eq!(config.dispatcher.poll_timeout_ms, 125);
    assert_eq!(config.dispatcher.default_concurrency, 2);
    assert_eq!(config.retry_topics[0].max_attempts, 4);
}

#[test]
#[serial]
fn test_load_missing_explicit_file_fails() {
    assert!(matches!(
        Config::load(Some("/nonexistent/detour.yaml")),
        Err(ConfigError::Load(_))
    ));
}
