//! Kafka producer for image-uploaded events.
//!
//! Wraps an rdkafka `FutureProducer` behind the [`EventPublisher`] seam so the
//! upload path can be exercised without a broker.

use crate::config::KafkaConfig;
use crate::event::ImageUploaded;
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Anything able to announce a freshly created image record.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event and wait for the broker's acknowledgement
    async fn publish(&self, event: &ImageUploaded) -> Result<DeliveryResult, ProducerError>;
}

/// Kafka-backed event producer
pub struct EventProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl EventProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Fetch cluster metadata to prove the brokers are reachable.
    ///
    /// librdkafka connects lazily, so without this a wrong address would only
    /// surface on the first publish.
    pub async fn verify_connectivity(&self) -> Result<(), ProducerError> {
        let producer = self.producer.clone();
        let topic = self.config.topics.image_uploaded.clone();
        let timeout = self.default_timeout;

        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
                .map_err(|e| ProducerError::Unreachable(e.to_string()))
        })
        .await
        .map_err(|e| ProducerError::Unreachable(e.to_string()))?
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Forward an undecodable message to the dead letter topic, if configured
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_payload: &[u8],
        error: &str,
    ) -> Result<Option<DeliveryResult>, ProducerError> {
        let Some(ref dlq_topic) = self.config.topics.dead_letter_queue else {
            return Ok(None);
        };

        let message = OutgoingMessage {
            topic: dlq_topic.clone(),
            key: None,
            payload: original_payload.to_vec(),
            headers: Vec::new(),
        }
        .with_message_type("dead_letter")
        .with_header("original-topic", original_topic)
        .with_header("error-reason", error)
        .with_header("failed-at", chrono::Utc::now().to_rfc3339());

        self.send(message).await.map(Some)
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    #[instrument(skip(self, event), fields(image_id = %event.image_id))]
    async fn publish(&self, event: &ImageUploaded) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::new_json(&self.config.topics.image_uploaded, event)?
            .with_key(event.key())
            .with_message_type("image_uploaded");

        self.send(message).await
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn test_outgoing_message_builder() {
        let event = ImageUploaded {
            image_id: "id-1".to_string(),
            image_url: "u".to_string(),
            url: "v".to_string(),
            uploaded_at: None,
        };

        let message = OutgoingMessage::new_json("image-uploaded", &event)
            .unwrap()
            .with_key(event.key())
            .with_message_type("image_uploaded");

        assert_eq!(message.key, Some("id-1".to_string()));
        assert_eq!(message.headers.len(), 1);

        let decoded: ImageUploaded = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_owned_headers_carry_values() {
        let message = OutgoingMessage {
            topic: "t".to_string(),
            key: None,
            payload: Vec::new(),
            headers: Vec::new(),
        }
        .with_header("a", "1")
        .with_header("b", "2");

        let headers = message.owned_headers();
        assert_eq!(headers.count(), 2);
        assert_eq!(headers.get(1).key, "b");
    }
}
