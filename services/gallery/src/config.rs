use gallery_events::KafkaConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration; all of them are fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the gallery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    pub api: ApiConfig,
    /// Record store configuration
    pub database: DatabaseConfig,
    /// Event channel configuration
    pub kafka: KafkaConfig,
    /// Blob storage configuration
    #[serde(default)]
    pub blobs: BlobConfig,
    /// Upload handling configuration
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    pub port: u16,
    /// Base URL under which stored payloads are reachable; derived from the
    /// port when unset
    pub public_base_url: Option<String>,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Schema holding the image records
    pub namespace: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Where uploaded payloads are written
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    Local,
    S3,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Storage backend
    #[serde(default = "default_blob_backend")]
    pub backend: BlobBackend,
    /// Upload directory for the local backend
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// S3 settings, required for the s3 backend
    pub s3: Option<S3Config>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL of the bucket; virtual-hosted AWS URL when unset
    pub public_base_url: Option<String>,
}

/// Upload handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Template of the display URL; `{name}` is replaced by the file stem
    #[serde(default = "default_display_url_template")]
    pub display_url_template: String,
    /// Maximum accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Give up re-publishing an event after this many seconds
    #[serde(default = "default_publish_max_elapsed_secs")]
    pub publish_max_elapsed_secs: u64,
    /// How long shutdown waits for in-flight announcements
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_blob_backend() -> BlobBackend {
    BlobBackend::Local
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_display_url_template() -> String {
    "https://www.{name}.com".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_publish_max_elapsed_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from config files and the environment, then validate
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/gallery/gallery").required(false))
            // GALLERY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that deserialized but cannot be used
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.port == 0 {
            return Err(ConfigError::MissingRequired("api.port".to_string()));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }

        if self.database.namespace.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "database.namespace".to_string(),
            ));
        }

        if !is_identifier(&self.database.namespace) {
            return Err(ConfigError::InvalidValue {
                key: "database.namespace".to_string(),
                message: "expected lowercase letters, digits and underscores".to_string(),
            });
        }

        self.kafka.validate().map_err(|e| match e {
            gallery_events::ConfigError::MissingRequired(key) => ConfigError::MissingRequired(key),
            gallery_events::ConfigError::InvalidValue { key, message } => {
                ConfigError::InvalidValue { key, message }
            }
        })?;

        if self.blobs.backend == BlobBackend::S3 && self.blobs.s3.is_none() {
            return Err(ConfigError::MissingRequired("blobs.s3".to_string()));
        }

        if !self.ingest.display_url_template.contains("{name}") {
            return Err(ConfigError::InvalidValue {
                key: "ingest.display_url_template".to_string(),
                message: "must contain the {name} placeholder".to_string(),
            });
        }

        Ok(())
    }

    /// Base URL stored payloads are served from
    pub fn public_base_url(&self) -> String {
        self.api
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.api.port))
            .trim_end_matches('/')
            .to_string()
    }

    /// Get the publish retry budget as Duration
    pub fn publish_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.ingest.publish_max_elapsed_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.ingest.shutdown_grace_secs)
    }
}

impl DatabaseConfig {
    /// Get pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some('a'..='z' | '_'))
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            upload_dir: default_upload_dir(),
            s3: None,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            display_url_template: default_display_url_template(),
            max_upload_bytes: default_max_upload_bytes(),
            publish_max_elapsed_secs: default_publish_max_elapsed_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(toml: &str) -> Result<Config, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    const COMPLETE: &str = r#"
        [api]
        port = 3000

        [database]
        url = "postgres://localhost/gallery"
        namespace = "gallery"

        [kafka]
        bootstrap_servers = "localhost:9092"
    "#;

    #[test]
    fn test_complete_config_loads_with_defaults() {
        let config = parse(COMPLETE).unwrap();

        assert_eq!(config.api.port, 3000);
        assert_eq!(config.blobs.backend, BlobBackend::Local);
        assert_eq!(config.blobs.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.ingest.display_url_template, "https://www.{name}.com");
        assert_eq!(config.kafka.topics.image_uploaded, "image-uploaded");
        assert_eq!(config.public_base_url(), "http://localhost:3000");
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_port_is_fatal() {
        let toml = COMPLETE.replace("port = 3000", "");
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn test_missing_namespace_is_fatal() {
        let toml = COMPLETE.replace("namespace = \"gallery\"", "");
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn test_empty_store_url_is_fatal() {
        let toml = COMPLETE.replace("postgres://localhost/gallery", "");
        assert!(matches!(
            parse(&toml),
            Err(ConfigError::MissingRequired(key)) if key == "database.url"
        ));
    }

    #[test]
    fn test_missing_channel_address_is_fatal() {
        let toml = COMPLETE.replace("bootstrap_servers = \"localhost:9092\"", "");
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn test_namespace_must_be_identifier() {
        let toml = COMPLETE.replace("namespace = \"gallery\"", "namespace = \"a; DROP\"");
        assert!(matches!(
            parse(&toml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_s3_backend_requires_settings() {
        let toml = format!("{COMPLETE}\n[blobs]\nbackend = \"s3\"\n");
        assert!(matches!(
            parse(&toml),
            Err(ConfigError::MissingRequired(key)) if key == "blobs.s3"
        ));
    }

    #[test]
    fn test_public_base_url_trims_trailing_slash() {
        let toml = COMPLETE.replace(
            "port = 3000",
            "port = 3000\npublic_base_url = \"https://img.example.com/\"",
        );
        let config = parse(&toml).unwrap();
        assert_eq!(config.public_base_url(), "https://img.example.com");
    }
}
