use super::*;
use rdkafka::message::Headers as _;

#[test]
fn test_from_config_copies_connection_settings() {
    let config = KafkaConfig {
        bootstrap_servers: "broker-1:9092,broker-2:9092".to_string(),
        sasl_username: Some("svc".to_string()),
        session_timeout_ms: 10_000,
        ..Default::default()
    };

    let transport = KafkaTransportConfig::from_config(&config);
    assert_eq!(transport.bootstrap_servers, "broker-1:9092,broker-2:9092");
    assert_eq!(transport.sasl_username.as_deref(), Some("svc"));
    assert_eq!(transport.session_timeout_ms, 10_000);
}

#[test]
fn test_sasl_config() {
    let config = KafkaTransportConfig::new("localhost:9092").with_sasl(
        "user",
        "pass",
        "SCRAM-SHA-256",
    );

    assert_eq!(config.sasl_username, Some("user".to_string()));
    assert_eq!(config.sasl_password, Some("pass".to_string()));
    assert_eq!(config.sasl_mechanism, Some("SCRAM-SHA-256".to_string()));
    assert_eq!(config.security_protocol, Some("SASL_SSL".to_string()));
}

#[test]
fn test_consumer_config_disables_auto_commit() {
    let config = KafkaTransportConfig::new("localhost:9092");
    let client = config.consumer_config("orders-retry-0");

    assert_eq!(client.get("group.id"), Some("orders-retry-0"));
    assert_eq!(client.get("enable.auto.commit"), Some("false"));
    assert_eq!(client.get("session.timeout.ms"), Some("45000"));
}

#[test]
fn test_producer_config_waits_for_all_replicas() {
    let config = KafkaTransportConfig::new("localhost:9092").with_ssl_ca("/etc/ca.pem");
    let client = config.producer_config();

    assert_eq!(client.get("acks"), Some("all"));
    assert_eq!(client.get("enable.idempotence"), Some("true"));
    assert_eq!(client.get("ssl.ca.location"), Some("/etc/ca.pem"));
}

#[test]
fn test_headers_convert_to_kafka() {
    let mut headers = Headers::new();
    headers.push("detour-attempts", "2");
    headers.push("trace", "abc");

    let converted = to_kafka_headers(&headers);
    assert_eq!(converted.count(), 2);
    assert_eq!(converted.get(0).key, "detour-attempts");
    assert_eq!(converted.get(1).value, Some(&b"abc"[..]));
}
