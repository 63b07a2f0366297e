//! Represents an object stored in a bucket.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

/// Object metadata as returned by a metadata fetch. The payload itself is
/// read separately as a stream.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMetadata {
    /// Parent bucket name.
    pub bucket: String,

    /// Object key within the bucket.
    pub name: String,

    /// Size in bytes. The JSON API encodes this as a decimal string.
    #[serde(with = "string_u64")]
    pub size: u64,

    /// Base64-encoded MD5 of the payload. Absent for composite objects.
    pub md5_hash: Option<String>,

    /// Content type (MIME type).
    pub content_type: Option<String>,
}

impl ObjectMetadata {
    /// MD5 of the payload as lowercase hex, when the service provided one.
    pub fn md5_hex(&self) -> Option<String> {
        let encoded = self.md5_hash.as_deref()?;
        let raw = general_purpose::STANDARD.decode(encoded).ok()?;
        let digest = <[u8; 16]>::try_from(raw).ok()?;
        Some(format!("{:x}", md5::Digest(digest)))
    }
}

/// Build the `gs://` URI for an object.
pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("gs://{}/{}", bucket, key)
}

/// Split a `gs://bucket/key` URI into its parts.
pub fn parse_object_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("gs://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

mod string_u64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(D::Error::custom),
            Raw::Number(n) => Ok(n),
        }
    }
}
