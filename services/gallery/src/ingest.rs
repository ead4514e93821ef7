//! Upload ingestion: payload → blob store → record store → event channel.
//!
//! The record write completes before the caller gets a response. The event is
//! published afterwards from a detached task, so broker latency never shows
//! up in the upload request and a broker outage never fails it. The local
//! record stays authoritative when publishing gives up; other instances miss
//! the record until it is announced again.
//!
//! Announcements are tracked so shutdown can wait for them with
//! [`IngestService::drain`] before the producer is flushed.

use crate::blob_store::{generate_blob_name, BlobStore};
use crate::error::GalleryError;
use crate::record::{ImageId, ImageRecord};
use crate::record_store::RecordStore;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use chrono::Utc;
use gallery_events::{EventPublisher, ImageUploaded};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

/// Retry schedule for publishing an event
#[derive(Debug, Clone)]
pub struct PublishRetry {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl PublishRetry {
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            max_elapsed,
        }
    }
}

/// Display URL for an upload: the original file stem embedded in `template`.
///
/// `cat.png` with `https://www.{name}.com` gives `https://www.cat.com`.
pub fn display_url(template: &str, original_filename: &str) -> String {
    let stem = Path::new(original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    template.replace("{name}", stem)
}

pub struct IngestService {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    publisher: Arc<dyn EventPublisher>,
    display_url_template: String,
    retry: PublishRetry,
    tasks: TaskTracker,
    abandon: CancellationToken,
}

impl IngestService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        publisher: Arc<dyn EventPublisher>,
        display_url_template: impl Into<String>,
        retry: PublishRetry,
    ) -> Self {
        Self {
            blobs,
            records,
            publisher,
            display_url_template: display_url_template.into(),
            retry,
            tasks: TaskTracker::new(),
            abandon: CancellationToken::new(),
        }
    }

    /// Store the payload and create its record
    #[instrument(skip(self, bytes), fields(filename = %original_filename, size_bytes = bytes.len()))]
    pub async fn ingest(
        &self,
        bytes: Bytes,
        original_filename: &str,
    ) -> Result<ImageRecord, GalleryError> {
        if bytes.is_empty() {
            return Err(GalleryError::validation(
                "Uploaded file is empty",
                "EMPTY_FILE",
            ));
        }

        let size_bytes = bytes.len() as u64;
        let blob_name = generate_blob_name(original_filename);
        let image_url = self.blobs.put(&blob_name, bytes).await?;

        let record = ImageRecord {
            id: ImageId::generate(),
            image_url,
            url: display_url(&self.display_url_template, original_filename),
            uploaded_at: Utc::now(),
        };

        if let Err(e) = self.records.insert(&record).await {
            if let Err(cleanup) = self.blobs.delete(&blob_name).await {
                warn!(blob = %blob_name, error = %cleanup, "Orphaned blob left behind");
            }
            return Err(e.into());
        }

        metrics::counter!("gallery.uploads.stored").increment(1);
        metrics::counter!("gallery.uploads.bytes").increment(size_bytes);

        info!(
            image_id = %record.id,
            image_url = %record.image_url,
            "Image record created"
        );

        Ok(record)
    }

    /// Publish the record's event from a detached task.
    ///
    /// The handle resolves to whether the event reached the broker; callers
    /// on the request path drop it.
    pub fn announce(&self, record: &ImageRecord) -> JoinHandle<bool> {
        let publisher = Arc::clone(&self.publisher);
        let retry = self.retry.clone();
        let abandon = self.abandon.clone();
        let event = record.to_event();

        self.tasks.spawn(async move {
            publish_with_retry(publisher.as_ref(), &event, &retry, &abandon).await
        })
    }

    /// Wait for in-flight announcements.
    ///
    /// Announcements still retrying after `grace` are told to give up; each
    /// one logs and counts its event as unpublished. Returns the number that
    /// had not stopped a further `grace` later.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.tasks.close();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_ok() {
            return 0;
        }

        warn!(
            pending = self.tasks.len(),
            "Abandoning image uploaded events still being retried"
        );
        self.abandon.cancel();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_ok() {
            return 0;
        }

        let stuck = self.tasks.len();
        metrics::counter!("gallery.events.publish_failed").increment(stuck as u64);
        error!(stuck, "Event announcements did not stop; their events are lost");
        stuck
    }
}

#[instrument(skip(publisher, event, retry, abandon), fields(image_id = %event.image_id))]
async fn publish_with_retry(
    publisher: &dyn EventPublisher,
    event: &ImageUploaded,
    retry: &PublishRetry,
    abandon: &CancellationToken,
) -> bool {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(retry.initial_interval)
        .with_max_interval(retry.max_interval)
        .with_max_elapsed_time(Some(retry.max_elapsed))
        .build();

    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match publisher.publish(event).await {
            Ok(delivery) => {
                metrics::counter!("gallery.events.published").increment(1);
                info!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    attempts,
                    "Image uploaded event published"
                );
                return true;
            }
            Err(e) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abandon.cancelled() => {
                            metrics::counter!("gallery.events.publish_failed").increment(1);
                            error!(
                                attempts,
                                error = %e,
                                "Shutting down before image uploaded event was published; record exists only locally"
                            );
                            return false;
                        }
                    }
                }
                None => {
                    metrics::counter!("gallery.events.publish_failed").increment(1);
                    error!(
                        attempts,
                        error = %e,
                        "Giving up publishing image uploaded event; record exists only locally"
                    );
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blob_store::{BlobError, LocalBlobStore};
    use crate::record_store::{InMemoryRecordStore, MockRecordStore, StoreError};
    use async_trait::async_trait;
    use gallery_events::{DeliveryResult, ProducerError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Publisher double that forwards every successful event to a channel and
    /// fails the first `failures` attempts
    pub(crate) struct RecordingPublisher {
        failures: AtomicU32,
        sent: mpsc::UnboundedSender<ImageUploaded>,
    }

    impl RecordingPublisher {
        pub(crate) fn new(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ImageUploaded>) {
            let (sent, received) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    failures: AtomicU32::new(failures),
                    sent,
                }),
                received,
            )
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &ImageUploaded) -> Result<DeliveryResult, ProducerError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProducerError::SendError {
                    topic: "image-uploaded".to_string(),
                    message: "broker down".to_string(),
                });
            }

            let _ = self.sent.send(event.clone());
            Ok(DeliveryResult {
                topic: "image-uploaded".to_string(),
                partition: 0,
                offset: 0,
                key: Some(event.image_id.clone()),
            })
        }
    }

    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(&self, name: &str, _bytes: Bytes) -> Result<String, BlobError> {
            Err(BlobError::S3 {
                name: name.to_string(),
                message: "bucket missing".to_string(),
            })
        }

        async fn delete(&self, _name: &str) -> Result<(), BlobError> {
            Ok(())
        }
    }

    fn sample_record() -> ImageRecord {
        ImageRecord {
            id: ImageId::generate(),
            image_url: "http://localhost:3000/uploads/1-a.png".to_string(),
            url: "https://www.cat.com".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    pub(crate) fn fast_retry() -> PublishRetry {
        PublishRetry {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_display_url_strips_extension() {
        let template = "https://www.{name}.com";
        assert_eq!(display_url(template, "cat.png"), "https://www.cat.com");
        assert_eq!(display_url(template, "archive.tar.gz"), "https://www.archive.tar.com");
        assert_eq!(display_url(template, "noext"), "https://www.noext.com");
        assert_eq!(display_url(template, "dir/dog.jpg"), "https://www.dog.com");
    }

    #[tokio::test]
    async fn test_ingest_writes_blob_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(
            LocalBlobStore::new(dir.path(), "http://localhost:3000")
                .await
                .unwrap(),
        );
        let records = Arc::new(InMemoryRecordStore::new());
        let (publisher, _events) = RecordingPublisher::new(0);
        let service = IngestService::new(
            blobs,
            records.clone(),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );

        let record = service
            .ingest(Bytes::from_static(b"\x89PNG"), "cat.png")
            .await
            .unwrap();

        assert_eq!(record.url, "https://www.cat.com");
        assert!(record.image_url.starts_with("http://localhost:3000/uploads/"));
        assert!(record.image_url.ends_with(".png"));
        assert_eq!(records.get(&record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_empty_payload_rejected_without_side_effects() {
        let records = Arc::new(InMemoryRecordStore::new());
        let (publisher, _events) = RecordingPublisher::new(0);
        let service = IngestService::new(
            Arc::new(FailingBlobStore),
            records.clone(),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );

        let err = service.ingest(Bytes::new(), "cat.png").await.unwrap_err();
        assert!(matches!(err, GalleryError::Validation { .. }));
        assert!(records.is_empty().await);
    }

    #[tokio::test]
    async fn test_blob_failure_creates_no_record() {
        let records = Arc::new(InMemoryRecordStore::new());
        let (publisher, _events) = RecordingPublisher::new(0);
        let service = IngestService::new(
            Arc::new(FailingBlobStore),
            records.clone(),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );

        let err = service
            .ingest(Bytes::from_static(b"data"), "cat.png")
            .await
            .unwrap_err();
        assert!(matches!(err, GalleryError::Blob(_)));
        assert!(records.is_empty().await);
    }

    #[tokio::test]
    async fn test_announce_carries_record_id() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path(), "http://h").await.unwrap());
        let (publisher, mut events) = RecordingPublisher::new(0);
        let service = IngestService::new(
            blobs,
            Arc::new(InMemoryRecordStore::new()),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );

        let record = service
            .ingest(Bytes::from_static(b"data"), "cat.png")
            .await
            .unwrap();
        assert!(service.announce(&record).await.unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event.image_id, record.id.as_str());
        assert_eq!(event.image_url, record.image_url);
        assert_eq!(event.url, record.url);
        assert_eq!(event.uploaded_at, Some(record.uploaded_at));
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let (publisher, mut events) = RecordingPublisher::new(2);
        let event = ImageUploaded {
            image_id: "X".to_string(),
            image_url: "u".to_string(),
            url: "v".to_string(),
            uploaded_at: None,
        };

        assert!(
            publish_with_retry(
                publisher.as_ref(),
                &event,
                &fast_retry(),
                &CancellationToken::new()
            )
            .await
        );
        assert_eq!(events.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_budget() {
        let (publisher, mut events) = RecordingPublisher::new(u32::MAX);
        let event = ImageUploaded {
            image_id: "X".to_string(),
            image_url: "u".to_string(),
            url: "v".to_string(),
            uploaded_at: None,
        };
        let retry = PublishRetry {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_millis(20),
        };

        assert!(
            !publish_with_retry(publisher.as_ref(), &event, &retry, &CancellationToken::new())
                .await
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_record_failure_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path(), "http://h").await.unwrap());
        let mut records = MockRecordStore::new();
        records
            .expect_insert()
            .times(1)
            .returning(|record| Err(StoreError::Conflict(record.id.clone())));
        let (publisher, _events) = RecordingPublisher::new(0);
        let service = IngestService::new(
            blobs,
            Arc::new(records),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );

        let err = service
            .ingest(Bytes::from_static(b"data"), "cat.png")
            .await
            .unwrap_err();

        assert!(matches!(err, GalleryError::Store(StoreError::Conflict(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_retrying_announce() {
        let (publisher, mut events) = RecordingPublisher::new(1);
        let service = IngestService::new(
            Arc::new(FailingBlobStore),
            Arc::new(InMemoryRecordStore::new()),
            publisher,
            "https://www.{name}.com",
            fast_retry(),
        );
        let record = sample_record();

        let handle = service.announce(&record);
        assert_eq!(service.drain(Duration::from_secs(5)).await, 0);

        assert!(handle.await.unwrap());
        assert_eq!(events.try_recv().unwrap().image_id, record.id.as_str());
    }

    #[tokio::test]
    async fn test_drain_abandons_stalled_announce() {
        let (publisher, mut events) = RecordingPublisher::new(u32::MAX);
        let service = IngestService::new(
            Arc::new(FailingBlobStore),
            Arc::new(InMemoryRecordStore::new()),
            publisher,
            "https://www.{name}.com",
            PublishRetry {
                initial_interval: Duration::from_millis(50),
                max_interval: Duration::from_millis(50),
                max_elapsed: Duration::from_secs(3600),
            },
        );

        let handle = service.announce(&sample_record());
        assert_eq!(service.drain(Duration::from_millis(100)).await, 0);

        assert!(!handle.await.unwrap());
        assert!(events.try_recv().is_err());
    }
}
