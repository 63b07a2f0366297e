//! Represents a storage bucket, the namespace for exported images.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for bucket names generated when no bucket is configured.
pub const DEFAULT_BUCKET_PREFIX: &str = "forklift";

/// A storage bucket in the source project.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Bucket {
    /// Globally unique bucket name.
    pub name: String,

    /// Location the bucket was created in (e.g. "US").
    pub location: Option<String>,

    /// When this bucket was created.
    pub time_created: Option<DateTime<Utc>>,
}

/// Derive a bucket name from [`DEFAULT_BUCKET_PREFIX`] and a timestamp,
/// e.g. `forklift-20240131235959`.
pub fn default_bucket_name(now: DateTime<Utc>) -> String {
    format!("{}-{}", DEFAULT_BUCKET_PREFIX, now.format("%Y%m%d%H%M%S"))
}
