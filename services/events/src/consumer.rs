//! Kafka consumer for image-uploaded events.
//!
//! Each message is handed to a [`MessageHandler`] which returns an explicit
//! [`Disposition`]. Offsets are committed only for acknowledged messages; a
//! requeued message is fetched again after a backoff, and nothing behind it on
//! the same partition is handled until it has been.

use crate::config::KafkaConfig;
use crate::producer::EventProducer;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Failed to rewind {topic}/{partition} to offset {offset}: {message}")]
    SeekError {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Timestamp of the message
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// Outcome of handling one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Applied durably; commit the offset
    Ack,
    /// Not applied; leave uncommitted and deliver again
    Requeue,
    /// Can never be applied; dead-letter it and move on
    Reject { reason: String },
}

/// Handler bound to a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &IncomingMessage) -> Disposition;
}

/// Settles messages with the channel once their disposition is known
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Mark the message as processed
    async fn ack(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError>;

    /// Arrange for the message to be delivered again
    async fn requeue(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError>;

    /// Park a message that can never be processed
    async fn dead_letter(&self, message: &IncomingMessage, reason: &str) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            reason,
            "Discarding unprocessable message"
        );
    }
}

/// Run the handler on one message and settle it accordingly
pub async fn dispatch<H, A>(
    handler: &H,
    acknowledger: &A,
    message: &IncomingMessage,
) -> Result<Disposition, ConsumerError>
where
    H: MessageHandler + ?Sized,
    A: Acknowledger + ?Sized,
{
    let disposition = handler.handle(message).await;

    match &disposition {
        Disposition::Ack => acknowledger.ack(&message.metadata).await?,
        Disposition::Requeue => acknowledger.requeue(&message.metadata).await?,
        Disposition::Reject { reason } => {
            acknowledger.dead_letter(message, reason).await;
            acknowledger.ack(&message.metadata).await?;
        }
    }

    Ok(disposition)
}

/// Tracks partitions blocked behind a requeued message.
///
/// Kafka commits are cumulative, so acknowledging anything past a requeued
/// offset would silently drop it. Messages that are already buffered behind it
/// are skipped until the requeued offset comes round again.
#[derive(Debug, Default)]
pub struct RedeliveryGuard {
    pending: HashMap<(String, i32), i64>,
}

impl RedeliveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message may be handled now
    pub fn admit(&mut self, metadata: &MessageMetadata) -> bool {
        let key = (metadata.topic.clone(), metadata.partition);
        match self.pending.get(&key) {
            Some(&offset) if metadata.offset > offset => false,
            Some(&offset) if metadata.offset == offset => {
                self.pending.remove(&key);
                true
            }
            _ => true,
        }
    }

    /// Block the message's partition until it is redelivered
    pub fn hold(&mut self, metadata: &MessageMetadata) {
        self.pending
            .insert((metadata.topic.clone(), metadata.partition), metadata.offset);
    }

    /// Number of partitions waiting on a redelivery
    pub fn blocked_partitions(&self) -> usize {
        self.pending.len()
    }
}

/// Per-instance subscription to the image-uploaded topic
pub struct EventSubscriber {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    group_id: String,
    dlq_producer: Option<Arc<EventProducer>>,
}

impl EventSubscriber {
    /// Create a consumer in a fresh per-instance group and bind it to the topic
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        let group_id = config.instance_group_id();

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config(&group_id)
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let topic = config.topics.image_uploaded.as_str();
        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(topic = %topic, group_id = %group_id, "Subscribed to Kafka topic");

        Ok(Self {
            consumer,
            config: Arc::new(config),
            group_id,
            dlq_producer: None,
        })
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<EventProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    /// Consumer group this instance belongs to
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Consume messages until the token is cancelled.
    ///
    /// Returns an error when a requeued message cannot be rewound; the caller
    /// should stop the process so consumption resumes from the last commit.
    #[instrument(skip(self, handler, shutdown), fields(group_id = %self.group_id))]
    pub async fn run<H: MessageHandler + ?Sized>(
        &self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let mut guard = RedeliveryGuard::new();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => match message_result {
                    Some(Ok(borrowed_message)) => convert_message(&borrowed_message),
                    Some(Err(e)) => {
                        error!(error = %e, "Kafka consumer error");
                        continue;
                    }
                    None => {
                        debug!("Stream ended");
                        break;
                    }
                },
            };

            if !guard.admit(&incoming.metadata) {
                debug!(
                    partition = incoming.metadata.partition,
                    offset = incoming.metadata.offset,
                    "Skipping message behind pending redelivery"
                );
                continue;
            }

            match dispatch(handler.as_ref(), self, &incoming).await {
                Ok(Disposition::Requeue) => {
                    guard.hold(&incoming.metadata);
                    if !redelivery_pause(self.config.redelivery_backoff(), &shutdown).await {
                        info!("Received shutdown signal during redelivery backoff");
                        break;
                    }
                }
                Ok(_) => {}
                // Applied but not committed; a redelivery is absorbed downstream
                Err(ConsumerError::CommitError(e)) => {
                    warn!(error = %e, "Offset commit failed");
                }
                Err(e) => return Err(e),
            }
        }

        info!("Message consumption loop stopped");
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for EventSubscriber {
    async fn ack(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &metadata.topic,
            metadata.partition,
            Offset::Offset(metadata.offset + 1),
        )
        .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        if let Err(e) = self.consumer.commit(&tpl, CommitMode::Async) {
            // A lost commit only causes a harmless redelivery
            warn!(error = %e, offset = metadata.offset, "Failed to commit offset");
        }

        Ok(())
    }

    async fn requeue(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        warn!(
            partition = metadata.partition,
            offset = metadata.offset,
            backoff_ms = self.config.redelivery_backoff().as_millis() as u64,
            "Message not acknowledged, scheduling redelivery"
        );

        self.consumer
            .seek(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset),
                Duration::from_secs(10),
            )
            .map_err(|e| ConsumerError::SeekError {
                topic: metadata.topic.clone(),
                partition: metadata.partition,
                offset: metadata.offset,
                message: e.to_string(),
            })
    }

    async fn dead_letter(&self, message: &IncomingMessage, reason: &str) {
        warn!(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            reason,
            "Rejecting unprocessable message"
        );

        if let Some(ref dlq) = self.dlq_producer {
            if let Err(e) = dlq
                .send_to_dlq(&message.metadata.topic, &message.payload, reason)
                .await
            {
                error!(error = %e, "Failed to send to DLQ");
            }
        }
    }
}

/// Hold off consumption before a requeued message comes round again.
///
/// Returns `false` when `shutdown` fires first.
async fn redelivery_pause(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => true,
        _ = shutdown.cancelled() => false,
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn message(partition: i32, offset: i64) -> IncomingMessage {
        IncomingMessage {
            payload: br#"{"imageId":"X","imageUrl":"u","url":"v"}"#.to_vec(),
            metadata: MessageMetadata {
                topic: "image-uploaded".to_string(),
                partition,
                offset,
                key: Some(b"X".to_vec()),
                timestamp: Some(1234567890),
                headers: HashMap::new(),
            },
        }
    }

    struct FixedHandler(Disposition);

    #[async_trait]
    impl MessageHandler for FixedHandler {
        async fn handle(&self, _message: &IncomingMessage) -> Disposition {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingAcknowledger {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self, _metadata: &MessageMetadata) -> Result<(), ConsumerError> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn requeue(&self, _metadata: &MessageMetadata) -> Result<(), ConsumerError> {
            self.calls.lock().unwrap().push("requeue");
            Ok(())
        }

        async fn dead_letter(&self, _message: &IncomingMessage, _reason: &str) {
            self.calls.lock().unwrap().push("dead_letter");
        }
    }

    #[tokio::test]
    async fn test_ack_commits() {
        let acker = RecordingAcknowledger::default();
        let disposition = dispatch(&FixedHandler(Disposition::Ack), &acker, &message(0, 1))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_requeue_never_acks() {
        let acker = RecordingAcknowledger::default();
        let disposition = dispatch(&FixedHandler(Disposition::Requeue), &acker, &message(0, 1))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(*acker.calls.lock().unwrap(), vec!["requeue"]);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_then_acks() {
        let acker = RecordingAcknowledger::default();
        let handler = FixedHandler(Disposition::Reject {
            reason: "bad payload".to_string(),
        });

        dispatch(&handler, &acker, &message(0, 1)).await.unwrap();
        assert_eq!(*acker.calls.lock().unwrap(), vec!["dead_letter", "ack"]);
    }

    #[tokio::test]
    async fn test_redelivery_pause_yields_to_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let paused = tokio::time::timeout(
            Duration::from_secs(1),
            redelivery_pause(Duration::from_secs(3600), &shutdown),
        )
        .await
        .unwrap();

        assert!(!paused);
    }

    #[tokio::test]
    async fn test_redelivery_pause_elapses() {
        let shutdown = CancellationToken::new();
        assert!(redelivery_pause(Duration::from_millis(1), &shutdown).await);
    }

    #[test]
    fn test_guard_blocks_partition_until_redelivery() {
        let mut guard = RedeliveryGuard::new();
        let failed = message(0, 5);

        assert!(guard.admit(&failed.metadata));
        guard.hold(&failed.metadata);

        // Already buffered messages behind the failed one are held back
        assert!(!guard.admit(&message(0, 6).metadata));
        assert!(!guard.admit(&message(0, 7).metadata));
        // Other partitions keep flowing
        assert!(guard.admit(&message(1, 6).metadata));

        assert!(guard.admit(&failed.metadata));
        assert_eq!(guard.blocked_partitions(), 0);
        assert!(guard.admit(&message(0, 6).metadata));
    }

    #[test]
    fn test_incoming_message_accessors() {
        let mut msg = message(0, 1);
        msg.metadata
            .headers
            .insert("message-type".to_string(), "image_uploaded".to_string());

        assert_eq!(msg.header("message-type"), Some("image_uploaded"));
        assert_eq!(msg.key_str(), Some("X".to_string()));

        let event: crate::ImageUploaded = msg.decode_json().unwrap();
        assert_eq!(event.image_id, "X");
    }
}
