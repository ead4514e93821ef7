use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Announcement that an image record was created.
///
/// Published by the instance that accepted the upload and consumed by every
/// instance, including the publisher itself. `url` is carried verbatim and
/// never recomputed by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploaded {
    /// Identifier of the record; consumers upsert by it
    pub image_id: String,
    /// Location of the stored payload
    pub image_url: String,
    /// Synthetic display URL
    pub url: String,
    /// Creation time at the origin, absent in events from older publishers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl ImageUploaded {
    /// Message key used for partitioning; all events for one image share it
    pub fn key(&self) -> &str {
        &self.image_id
    }
}
