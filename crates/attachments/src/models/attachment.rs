//! Attachment model: metadata plus the encoded-payload bookkeeping

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{AttachmentCache, CacheKey};
use crate::compression::Compression;
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{AttachmentError, Result};

/// Unique identifier for an attachment (random UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentId(pub Uuid);

impl AttachmentId {
    /// Allocate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// 32-character lowercase hex form, used for cache file names
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AttachmentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for AttachmentId {
    type Err = AttachmentError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AttachmentError::invalid(format!("invalid attachment id {s:?}: {e}")))
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Everything `data()` sets, kept in one value so it is replaced as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Length of the original bytes
    pub size: u64,
    /// Length of the encoded blob
    pub compressed_size: u64,
    pub compression: Compression,
    /// Digest of the original bytes, never of the encoded blob
    pub digest: Digest,
}

/// Outcome of warming one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmStatus {
    /// A verified entry was already on disk
    AlreadyCached,
    /// The blob was decoded and written to the cache
    Materialized,
    /// An on-disk entry failed verification and was rewritten
    Repaired,
}

/// A stored file and its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    /// Display name
    pub filename: String,
    /// MIME type, if known
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set by [`Attachment::data`]; `None` until then
    pub payload: Option<Payload>,
    /// Last time the decompressed copy was materialized
    pub cached_at: Option<DateTime<Utc>>,
}

impl Attachment {
    /// Create an empty attachment with a fresh id
    pub fn new(filename: impl Into<String>, content_type: Option<String>) -> Self {
        Self::with_id(AttachmentId::new(), filename, content_type)
    }

    /// Create an empty attachment with a known id
    pub fn with_id(
        id: AttachmentId,
        filename: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            id,
            filename: filename.into(),
            content_type,
            created_at: Utc::now(),
            payload: None,
            cached_at: None,
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.payload.as_ref().map(|p| p.size)
    }

    pub fn compressed_size(&self) -> Option<u64> {
        self.payload.as_ref().map(|p| p.compressed_size)
    }

    pub fn compression(&self) -> Option<Compression> {
        self.payload.as_ref().map(|p| p.compression)
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.payload.as_ref().map(|p| &p.digest)
    }

    /// Encoded size as a fraction of the original size
    pub fn compression_ratio(&self) -> Option<f64> {
        let payload = self.payload.as_ref()?;
        if payload.size == 0 {
            return None;
        }
        Some(payload.compressed_size as f64 / payload.size as f64)
    }

    /// Encode `data` and record its sizes, digest and codec.
    ///
    /// Returns the encoded blob, which the caller persists together with this
    /// record. Nothing on `self` changes if encoding fails. Any cached copy is
    /// considered stale afterwards, so `cached_at` is cleared.
    pub fn data(
        &mut self,
        data: &[u8],
        compression: Compression,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>> {
        let digest = digest_algorithm.compute(data);
        let encoded = compression.encode(data)?;

        self.payload = Some(Payload {
            size: data.len() as u64,
            compressed_size: encoded.len() as u64,
            compression,
            digest,
        });
        self.cached_at = None;

        Ok(encoded)
    }

    fn require_payload(&self) -> Result<&Payload> {
        self.payload
            .as_ref()
            .ok_or_else(|| AttachmentError::invalid(format!("attachment {} has no data", self.id)))
    }

    /// Whether `decoded` matches the recorded size and digest
    pub fn verify(&self, decoded: &[u8]) -> bool {
        self.payload.as_ref().is_some_and(|payload| {
            payload.size == decoded.len() as u64 && payload.digest.verify(decoded)
        })
    }

    /// Decode the durable blob and check it against the recorded digest
    pub fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let payload = self.require_payload()?;
        let decoded = payload
            .compression
            .decode(encoded, Some(payload.size))
            .map_err(|e| e.for_attachment(self.id))?;

        if !self.verify(&decoded) {
            return Err(AttachmentError::Integrity {
                id: Some(self.id),
                message: format!(
                    "decoded {} bytes do not match recorded {} digest",
                    decoded.len(),
                    payload.digest.algorithm
                ),
            });
        }
        Ok(decoded)
    }

    /// Cache key of the current data version
    pub fn cache_key(&self) -> Result<CacheKey> {
        Ok(CacheKey::new(self.id, &self.require_payload()?.digest))
    }

    /// Make sure a verified decompressed copy is in `cache`.
    ///
    /// `load` returns the stored record together with its blob, read as one
    /// snapshot. It is only called when the blob actually has to be decoded,
    /// and the snapshot replaces `self`, so the entry written always belongs
    /// to the version that was decoded. On success `cached_at` is set to now;
    /// the caller persists it.
    pub fn warm<F>(&mut self, cache: &AttachmentCache, load: F) -> Result<WarmStatus>
    where
        F: FnOnce() -> Result<(Attachment, Vec<u8>)>,
    {
        let key = self.cache_key()?;

        // Touch first: an entry pruned between touch and read is just a miss
        let cached = match cache.touch(&key) {
            Ok(true) => cache.read(&key),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };

        let mut status = WarmStatus::Materialized;
        match cached {
            Ok(Some(cached)) if self.verify(&cached) => {
                self.cached_at = Some(Utc::now());
                return Ok(WarmStatus::AlreadyCached);
            }
            Ok(Some(_)) => {
                log::warn!("[CACHE] Cached copy of {} failed verification, rewriting", key);
                status = WarmStatus::Repaired;
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("[CACHE] Could not read cached copy of {}: {}", key, e);
            }
        }

        let (current, encoded) = load()?;
        let decoded = current.decode(&encoded)?;
        let key = current.cache_key()?;
        cache.write(&key, &decoded)?;
        *self = current;
        self.cached_at = Some(Utc::now());

        log::debug!(
            "[CACHE] Warmed {} ({} bytes, {:?})",
            key,
            decoded.len(),
            status
        );
        Ok(status)
    }
}
