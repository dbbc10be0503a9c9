//! detour-topics - resolve and create retry topic chains
//!
//! Loads the configuration, binds every configured endpoint to its retry
//! configuration, prints the resulting topic chains and creates the topics
//! on the configured transport.
//!
//! Usage: `detour-topics [CONFIG_PATH]`

use tracing::{error, info};

use detour::bus::init_transport;
use detour::config::Config;
use detour::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let mut registry = config.build_registry()?;
    info!(
        configurations = registry.configurations().len(),
        endpoints = config.endpoints.len(),
        "Retry topic configurations built"
    );

    let mut topics = Vec::new();
    for endpoint in &config.endpoints {
        let configuration = registry.bind_topics(&endpoint.topics)?;
        println!(
            "{} (group {}, configuration {})",
            endpoint.id,
            endpoint.group_id,
            configuration.name()
        );
        for main_topic in &endpoint.topics {
            for stage in configuration.chain().stages() {
                println!(
                    "  {:<40} {:<28} delay={}ms",
                    stage.topic_for(main_topic),
                    stage.destination_type.to_string(),
                    stage.delay_ms
                );
            }
            topics.extend(configuration.topics_to_create(main_topic));
        }
    }

    if topics.is_empty() {
        info!("No topics to create");
        return Ok(());
    }

    let transport = connect_with_retry("transport", || init_transport(&config.messaging))
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    transport.admin.create_topics(&topics).await?;
    info!(count = topics.len(), "Topics created");

    Ok(())
}
