//! Materializes `image-uploaded` events into the local record store.
//!
//! Every instance runs one of these on its own consumer group, including the
//! instance that published the event; the upsert makes that loopback a no-op.

use crate::record::ImageRecord;
use crate::record_store::{RecordStore, UpsertOutcome};
use async_trait::async_trait;
use chrono::Utc;
use gallery_events::{Disposition, ImageUploaded, IncomingMessage, MessageHandler};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

pub struct ReplicationHandler {
    records: Arc<dyn RecordStore>,
}

impl ReplicationHandler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl MessageHandler for ReplicationHandler {
    #[instrument(
        skip(self, message),
        fields(
            partition = message.metadata.partition,
            offset = message.metadata.offset
        )
    )]
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        let event: ImageUploaded = match message.decode_json() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable image uploaded event");
                metrics::counter!("gallery.replication.rejected").increment(1);
                return Disposition::Reject {
                    reason: e.to_string(),
                };
            }
        };

        let record = match ImageRecord::from_event(&event, Utc::now()) {
            Ok(record) => record,
            Err(e) => {
                warn!(image_id = %event.image_id, error = %e, "Event carries a malformed id");
                metrics::counter!("gallery.replication.rejected").increment(1);
                return Disposition::Reject {
                    reason: e.to_string(),
                };
            }
        };

        match self.records.upsert(&record).await {
            Ok(outcome) => {
                let label = match outcome {
                    UpsertOutcome::Inserted => "inserted",
                    UpsertOutcome::Updated => "updated",
                };
                metrics::counter!("gallery.replication.applied", "outcome" => label).increment(1);
                debug!(image_id = %record.id, outcome = label, "Replicated image record");
                Disposition::Ack
            }
            Err(e) => {
                // Not acknowledged, so the channel delivers it again
                metrics::counter!("gallery.replication.write_failed").increment(1);
                error!(
                    image_id = %record.id,
                    error = %e,
                    "Consume write error, event will be redelivered"
                );
                Disposition::Requeue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ImageId;
    use crate::record_store::{InMemoryRecordStore, MockRecordStore, StoreError};
    use gallery_events::{dispatch, Acknowledger, ConsumerError, MessageMetadata};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn message(payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "image-uploaded".to_string(),
                partition: 0,
                offset: 7,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
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
    async fn test_synthetic_event_is_stored() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handler = ReplicationHandler::new(store.clone());

        let disposition = handler
            .handle(&message(br#"{"imageId":"X","imageUrl":"u","url":"v"}"#))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        let stored = store
            .get(&ImageId::parse("X").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.image_url, "u");
        assert_eq!(stored.url, "v");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_keeps_one_record() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handler = ReplicationHandler::new(store.clone());
        let msg = message(br#"{"imageId":"X","imageUrl":"u","url":"v"}"#);

        assert_eq!(handler.handle(&msg).await, Disposition::Ack);
        assert_eq!(handler.handle(&msg).await, Disposition::Ack);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_loopback_of_own_upload_is_idempotent() {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = ImageRecord {
            id: ImageId::generate(),
            image_url: "http://localhost:3000/uploads/1-a.png".to_string(),
            url: "https://www.cat.com".to_string(),
            uploaded_at: Utc::now(),
        };
        store.insert(&record).await.unwrap();

        let payload = serde_json::to_vec(&record.to_event()).unwrap();
        let handler = ReplicationHandler::new(store.clone());

        assert_eq!(handler.handle(&message(&payload)).await, Disposition::Ack);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_malformed_events_are_rejected() {
        let handler = ReplicationHandler::new(Arc::new(InMemoryRecordStore::new()));

        assert!(matches!(
            handler.handle(&message(b"not json")).await,
            Disposition::Reject { .. }
        ));
        assert!(matches!(
            handler
                .handle(&message(br#"{"imageId":"a b","imageUrl":"u","url":"v"}"#))
                .await,
            Disposition::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn test_write_failure_is_not_acknowledged() {
        let mut store = MockRecordStore::new();
        store.expect_upsert().times(1).returning(|record| {
            Err(StoreError::Corrupt {
                id: record.id.to_string(),
                message: "disk full".to_string(),
            })
        });

        let handler = ReplicationHandler::new(Arc::new(store));
        let acker = RecordingAcknowledger::default();
        let msg = message(br#"{"imageId":"X","imageUrl":"u","url":"v"}"#);

        let disposition = dispatch(&handler, &acker, &msg).await.unwrap();

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(*acker.calls.lock().unwrap(), vec!["requeue"]);
    }

    #[tokio::test]
    async fn test_rejected_event_is_dead_lettered_then_acked() {
        let handler = ReplicationHandler::new(Arc::new(InMemoryRecordStore::new()));
        let acker = RecordingAcknowledger::default();

        dispatch(&handler, &acker, &message(b"{}")).await.unwrap();

        assert_eq!(*acker.calls.lock().unwrap(), vec!["dead_letter", "ack"]);
    }
}
