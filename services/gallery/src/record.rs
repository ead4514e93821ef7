use chrono::{DateTime, Utc};
use gallery_events::ImageUploaded;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

const MAX_ID_LEN: usize = 64;

/// Rejected image identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed image id: {reason}")]
pub struct InvalidImageId {
    pub reason: &'static str,
}

/// Globally unique identifier of an image record.
///
/// Opaque to the service: ids minted here are UUIDs, ids arriving from other
/// publishers only need to be 1 to 64 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId(String);

impl ImageId {
    /// Mint a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidImageId> {
        if raw.is_empty() {
            return Err(InvalidImageId { reason: "empty" });
        }
        if raw.len() > MAX_ID_LEN {
            return Err(InvalidImageId { reason: "too long" });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidImageId {
                reason: "unexpected character",
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ImageId {
    type Err = InvalidImageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageId {
    type Error = InvalidImageId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one uploaded image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    #[serde(rename = "_id")]
    pub id: ImageId,
    /// Location of the stored payload
    pub image_url: String,
    /// Synthetic display URL
    pub url: String,
    /// Creation time, never changed afterwards
    pub uploaded_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build the record a consumed event describes.
    ///
    /// `received_at` stands in for the creation time when the publisher did
    /// not send one.
    pub fn from_event(
        event: &ImageUploaded,
        received_at: DateTime<Utc>,
    ) -> Result<Self, InvalidImageId> {
        Ok(Self {
            id: ImageId::parse(&event.image_id)?,
            image_url: event.image_url.clone(),
            url: event.url.clone(),
            uploaded_at: event.uploaded_at.unwrap_or(received_at),
        })
    }

    /// Event announcing this record
    pub fn to_event(&self) -> ImageUploaded {
        ImageUploaded {
            image_id: self.id.to_string(),
            image_url: self.image_url.clone(),
            url: self.url.clone(),
            uploaded_at: Some(self.uploaded_at),
        }
    }
}
