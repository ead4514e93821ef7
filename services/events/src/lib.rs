//! Gallery Events - fanout event channel for image metadata replication
//!
//! Every gallery instance publishes an [`ImageUploaded`] event after storing a
//! new record and consumes the same topic from its own consumer group, so each
//! instance receives the full stream and materializes every record locally.
//!
//! # Example
//!
//! ```rust,no_run
//! use gallery_events::{EventProducer, EventPublisher, ImageUploaded, KafkaConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = EventProducer::new(config)?;
//!
//!     let event = ImageUploaded {
//!         image_id: "d4c2a8e0".to_string(),
//!         image_url: "http://localhost:3000/uploads/1700000000000-ab12.png".to_string(),
//!         url: "https://www.cat.com".to_string(),
//!         uploaded_at: None,
//!     };
//!     producer.publish(&event).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod consumer;
pub mod event;
pub mod producer;

pub use admin::{declare_topic, AdminError};
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, ReliabilityConfig, SaslConfig,
    SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    dispatch, Acknowledger, ConsumerError, Disposition, EventSubscriber, IncomingMessage,
    MessageHandler, MessageMetadata, RedeliveryGuard,
};
pub use event::ImageUploaded;
pub use producer::{DeliveryResult, EventProducer, EventPublisher, OutgoingMessage, ProducerError};

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;
