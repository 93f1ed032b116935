//! Represents a payload persisted in the vault, plus the virtual path that
//! dereferences it.

use bytes::Bytes;
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;

use super::media_type::MediaType;

/// A single stored payload, keyed by its sanitized filename.
///
/// Rows are written whole by `ObjectStore::put` and never partially updated.
#[derive(Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Unique key; sanitized and at most 255 characters.
    pub filename: String,

    /// Declared MIME type as written. Re-checked against the current policy
    /// on every read.
    pub media_type: String,

    /// Encoded image bytes.
    pub payload: Vec<u8>,

    /// Payload length recorded at write time.
    pub size_bytes: i64,

    /// Creation time, epoch milliseconds.
    pub created_at: i64,

    /// Sanitized name of the upload this payload came from, if known.
    pub original_name: Option<String>,

    /// Lowercase hex SHA-256 of `payload`.
    pub checksum: Option<String>,
}

impl StoredObject {
    /// The declared type, if it is still one the vault recognises.
    pub fn media(&self) -> Option<MediaType> {
        MediaType::from_mime(&self.media_type)
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.payload)
    }
}

/// `/{namespace}/{filename}`. Never persisted; recomputed from the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualPath {
    pub namespace: String,
    pub filename: String,
}

impl VirtualPath {
    pub fn new(namespace: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.namespace, self.filename)
    }
}
