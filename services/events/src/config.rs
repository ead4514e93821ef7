//! Kafka configuration for the gallery event channel.
//!
//! Connection, security and reliability settings for the producer that
//! announces uploads and for the per-instance consumer that replicates them.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
    /// Private key password
    pub key_password: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Retry and reliability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Number of client-level retries for failed produce requests
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable idempotent producer
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or -1 (all)
    #[serde(default = "default_acks")]
    pub acks: String,
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            enable_idempotence: true,
            acks: default_acks(),
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Linger time in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
        }
    }
}

/// Consumer-specific configuration.
///
/// Every running instance joins its own consumer group, so each instance
/// receives the full event stream instead of sharing partitions with its
/// peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Prefix of the per-instance consumer group
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
    /// Stable instance identifier; a random one is generated when unset
    pub instance_id: Option<String>,
    /// Auto offset reset for a freshly created group: earliest or latest
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Delay before a requeued message is fetched again
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

fn default_group_prefix() -> String {
    "gallery".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    300000
}

fn default_redelivery_backoff_ms() -> u64 {
    1000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_prefix: default_group_prefix(),
            instance_id: None,
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
        }
    }
}

/// Topic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Fanout topic carrying image-uploaded events
    #[serde(default = "default_image_uploaded_topic")]
    pub image_uploaded: String,
    /// Dead letter topic for undecodable events; disabled when unset
    pub dead_letter_queue: Option<String>,
    /// Partitions used when the topic has to be created
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// Replication factor used when the topic has to be created
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

fn default_image_uploaded_topic() -> String {
    "image-uploaded".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            image_uploaded: default_image_uploaded_topic(),
            dead_letter_queue: None,
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfig,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Reliability settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Topic configuration
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "gallery".to_string()
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }

    /// Consumer group joined by this instance.
    ///
    /// A missing instance id yields a fresh group on every start, which
    /// behaves like an anonymous exclusive queue bound to the topic.
    pub fn instance_group_id(&self) -> String {
        let instance = self
            .consumer
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        format!("{}-{}", self.consumer.group_prefix, instance)
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("message.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);

        config
    }

    /// Build a consumer ClientConfig for the given group.
    ///
    /// Auto commit is always disabled: offsets are committed only after the
    /// handler has durably applied a message.
    pub fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    /// Build an admin ClientConfig
    pub fn build_admin_config(&self) -> ClientConfig {
        self.build_base_config()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    /// Get redelivery backoff as Duration
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer.redelivery_backoff_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.topics.image_uploaded.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.topics.image_uploaded".to_string(),
            ));
        }

        match self.consumer.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "kafka.consumer.auto_offset_reset".to_string(),
                    message: format!("expected earliest or latest, got {other}"),
                })
            }
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_defaults() {
        let config = KafkaConfig::new("localhost:9092");
        assert_eq!(config.topics.image_uploaded, "image-uploaded");
        assert_eq!(config.consumer.auto_offset_reset, "latest");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_bootstrap_servers_rejected() {
        let config = KafkaConfig::new("  ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_invalid_offset_reset_rejected() {
        let mut config = KafkaConfig::new("localhost:9092");
        config.consumer.auto_offset_reset = "none".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_instance_groups_are_distinct() {
        let config = KafkaConfig::new("localhost:9092");
        let a = config.instance_group_id();
        let b = config.instance_group_id();
        assert!(a.starts_with("gallery-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fixed_instance_id_is_stable() {
        let mut config = KafkaConfig::new("localhost:9092");
        config.consumer.instance_id = Some("node-a".to_string());
        assert_eq!(config.instance_group_id(), "gallery-node-a");
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig::new("localhost:9092");
        let consumer_config = config.build_consumer_config("gallery-test");

        assert_eq!(consumer_config.get("group.id"), Some("gallery-test"));
        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_producer_config_build() {
        let config = KafkaConfig::new("localhost:9092");
        let producer_config = config.build_producer_config();

        assert!(producer_config.get("bootstrap.servers").is_some());
        assert_eq!(producer_config.get("acks"), Some("all"));
        assert!(producer_config.get("sasl.mechanism").is_none());
    }
}
