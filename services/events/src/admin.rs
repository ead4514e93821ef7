//! Topic declaration for the event channel.

use crate::config::KafkaConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Failed to create admin client: {0}")]
    CreationError(String),

    #[error("Failed to declare topic {topic}: {message}")]
    DeclareError { topic: String, message: String },
}

/// Create the image-uploaded topic unless it already exists.
///
/// Also fails when no broker answers within the request timeout, which makes
/// an unreachable channel a startup error.
pub async fn declare_topic(config: &KafkaConfig) -> Result<(), AdminError> {
    let admin: AdminClient<DefaultClientContext> = config
        .build_admin_config()
        .create()
        .map_err(|e| AdminError::CreationError(e.to_string()))?;

    let topic = config.topics.image_uploaded.as_str();
    let new_topic = NewTopic::new(
        topic,
        config.topics.partitions,
        TopicReplication::Fixed(config.topics.replication_factor),
    );
    let options = AdminOptions::new().operation_timeout(Some(config.request_timeout()));

    let results = admin
        .create_topics([&new_topic], &options)
        .await
        .map_err(|e| AdminError::DeclareError {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, "Created topic"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %name, "Topic already exists")
            }
            Err((name, code)) => {
                return Err(AdminError::DeclareError {
                    topic: name,
                    message: code.to_string(),
                })
            }
        }
    }

    Ok(())
}
