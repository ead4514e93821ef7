//! Gallery Service
//!
//! Image upload service whose instances share metadata through an event
//! channel. Each instance accepts uploads, stores the payload and a record
//! locally, and announces the record on the `image-uploaded` topic. Every
//! instance, the uploader included, consumes that topic and upserts the record
//! into its own store, so all stores converge on the union of uploads.
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload                                   Kafka
//! ┌──────────────┐    ┌──────────────┐      ┌────────────────┐
//! │ API          │───▶│ Ingest       │─────▶│ image-uploaded │
//! └──────────────┘    └──────────────┘      └────────────────┘
//!        │                 │      │                  │
//!        │                 ▼      ▼                  ▼
//!        │        ┌──────────┐ ┌──────────────┐ ┌──────────────┐
//!        │        │ Blob     │ │ Record       │◀│ Replication  │
//!        │        │ Store    │ │ Store        │ │ Handler      │
//!        │        └──────────┘ └──────────────┘ └──────────────┘
//!        │                            ▲
//!        └────── GET /images ─────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod ingest;
pub mod record;
pub mod record_store;
pub mod replication;

pub use api::{create_router, start_api_server, AppState, RouterOptions};
pub use blob_store::{BlobError, BlobStore, LocalBlobStore, S3BlobStore};
pub use config::Config;
pub use error::GalleryError;
pub use ingest::{IngestService, PublishRetry};
pub use record::{ImageId, ImageRecord, InvalidImageId};
pub use record_store::{InMemoryRecordStore, PgRecordStore, RecordStore, StoreError, UpsertOutcome};
pub use replication::ReplicationHandler;
