use crate::config::DatabaseConfig;
use crate::record::{ImageId, ImageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Record store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record {0} already exists")]
    Conflict(ImageId),

    #[error("Stored record {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Effect of an upsert on the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record with the id existed
    Inserted,
    /// A record with the id existed and was overwritten with the same id
    Updated,
}

/// Persistence for image records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write a record that must not exist yet
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError>;

    /// Insert or overwrite by id; `uploaded_at` of an existing record is kept
    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, StoreError>;

    /// Snapshot of every record, in no particular order
    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct ImageRow {
    id: String,
    image_url: String,
    url: String,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let id = ImageId::parse(&row.id).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            message: e.to_string(),
        })?;

        Ok(ImageRecord {
            id,
            image_url: row.image_url,
            url: row.url,
            uploaded_at: row.uploaded_at,
        })
    }
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect to PostgreSQL with every connection scoped to the namespace schema
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&config.url)?
            .options([("search_path", config.namespace.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await?;

        // The namespace was validated as a plain identifier
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\"",
            config.namespace
        ))
        .execute(&pool)
        .await?;

        info!(namespace = %config.namespace, "Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(image_id = %record.id))]
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (id, image_url, url, uploaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.image_url)
        .bind(&record.url)
        .bind(record.uploaded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(record.id.clone()));
        }

        debug!("Image record inserted");
        Ok(())
    }

    #[instrument(skip(self, record), fields(image_id = %record.id))]
    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, StoreError> {
        // xmax is zero only for a freshly inserted tuple
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO images (id, image_url, url, uploaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
                SET image_url = EXCLUDED.image_url,
                    url = EXCLUDED.url
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.image_url)
        .bind(&record.url)
        .bind(record.uploaded_at)
        .fetch_one(&self.pool)
        .await?;

        let outcome = if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };

        debug!(outcome = ?outcome, "Image record upserted");
        Ok(outcome)
    }

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, image_url, url, uploaded_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ImageRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, image_url, url, uploaded_at
            FROM images
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process record store, used when no database is wired in
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<ImageId, ImageRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn upsert(&self, record: &ImageRecord) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                existing.image_url = record.image_url.clone();
                existing.url = record.url.clone();
                Ok(UpsertOutcome::Updated)
            }
            None => {
                records.insert(record.id.clone(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
