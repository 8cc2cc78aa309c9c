//! Storage trait definitions

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Attachment, AttachmentId};

/// Query-level selection of attachments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentFilter {
    /// Only attachments with exactly this content type
    pub content_type: Option<String>,
    /// Only attachments with exactly this filename
    pub filename: Option<String>,
}

impl AttachmentFilter {
    /// Match every attachment
    pub fn all() -> Self {
        Self::default()
    }

    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    pub fn filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    /// Evaluate the filter in memory
    pub fn matches(&self, attachment: &Attachment) -> bool {
        let content_type_ok = match &self.content_type {
            Some(wanted) => attachment.content_type.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        let filename_ok = match &self.filename {
            Some(wanted) => &attachment.filename == wanted,
            None => true,
        };
        content_type_ok && filename_ok
    }
}

/// Trait for attachment persistence
///
/// The store is the source of truth: it owns each attachment's metadata row
/// and its encoded blob. Implementations must make [`AttachmentStore::save`]
/// all-or-nothing so no reader ever sees metadata without the matching blob.
pub trait AttachmentStore: Send + Sync {
    /// Insert or replace an attachment together with its encoded blob
    fn save(&self, attachment: &Attachment, encoded: &[u8]) -> Result<()>;

    /// Get attachment metadata by id
    fn get(&self, id: &AttachmentId) -> Result<Option<Attachment>>;

    /// Get metadata and the encoded blob from one consistent snapshot
    fn get_with_encoded(&self, id: &AttachmentId) -> Result<Option<(Attachment, Vec<u8>)>>;

    /// First attachment (oldest) with the given filename
    fn find_by_filename(&self, filename: &str) -> Result<Option<Attachment>> {
        Ok(self
            .list(&AttachmentFilter::filename(filename))?
            .into_iter()
            .next())
    }

    /// Attachments matching `filter`, ordered by creation time
    fn list(&self, filter: &AttachmentFilter) -> Result<Vec<Attachment>>;

    /// Count attachments matching `filter`
    fn count(&self, filter: &AttachmentFilter) -> Result<usize>;

    /// Record when the decompressed copy was materialized (or that it is gone)
    ///
    /// Returns false if the attachment doesn't exist.
    fn set_cached_at(&self, id: &AttachmentId, cached_at: Option<DateTime<Utc>>) -> Result<bool>;

    /// Reset `cached_at` on every attachment; returns how many changed
    fn clear_cached_at(&self) -> Result<usize>;

    /// Delete an attachment and its blob; returns whether it existed
    fn delete(&self, id: &AttachmentId) -> Result<bool>;

    /// Delete every attachment matching `filter`; returns the deleted ids
    fn delete_matching(&self, filter: &AttachmentFilter) -> Result<Vec<AttachmentId>>;
}
