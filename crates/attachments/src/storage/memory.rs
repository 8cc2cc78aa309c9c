//! In-memory attachment storage, for tests and embedding

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::traits::{AttachmentFilter, AttachmentStore};
use crate::error::{AttachmentError, Result};
use crate::models::{Attachment, AttachmentId};

struct StoredAttachment {
    attachment: Attachment,
    encoded: Vec<u8>,
}

/// In-memory attachment storage
///
/// Metadata and blob are replaced together under one write lock.
#[derive(Default)]
pub struct InMemoryAttachmentStore {
    rows: RwLock<HashMap<AttachmentId, StoredAttachment>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<AttachmentId, StoredAttachment>>> {
        self.rows
            .read()
            .map_err(|_| AttachmentError::Storage("attachment map lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<AttachmentId, StoredAttachment>>> {
        self.rows
            .write()
            .map_err(|_| AttachmentError::Storage("attachment map lock poisoned".into()))
    }
}

impl AttachmentStore for InMemoryAttachmentStore {
    fn save(&self, attachment: &Attachment, encoded: &[u8]) -> Result<()> {
        if attachment.payload.is_none() {
            return Err(AttachmentError::invalid(format!(
                "cannot save attachment {} before data is set",
                attachment.id
            )));
        }

        let mut rows = self.write()?;
        let mut stored = attachment.clone();
        // Creation time belongs to the first save
        if let Some(existing) = rows.get(&attachment.id) {
            stored.created_at = existing.attachment.created_at;
        }
        rows.insert(
            attachment.id,
            StoredAttachment {
                attachment: stored,
                encoded: encoded.to_vec(),
            },
        );
        Ok(())
    }

    fn get(&self, id: &AttachmentId) -> Result<Option<Attachment>> {
        Ok(self.read()?.get(id).map(|row| row.attachment.clone()))
    }

    fn get_with_encoded(&self, id: &AttachmentId) -> Result<Option<(Attachment, Vec<u8>)>> {
        Ok(self
            .read()?
            .get(id)
            .map(|row| (row.attachment.clone(), row.encoded.clone())))
    }

    fn list(&self, filter: &AttachmentFilter) -> Result<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = self
            .read()?
            .values()
            .filter(|row| filter.matches(&row.attachment))
            .map(|row| row.attachment.clone())
            .collect();
        attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(attachments)
    }

    fn count(&self, filter: &AttachmentFilter) -> Result<usize> {
        Ok(self
            .read()?
            .values()
            .filter(|row| filter.matches(&row.attachment))
            .count())
    }

    fn set_cached_at(&self, id: &AttachmentId, cached_at: Option<DateTime<Utc>>) -> Result<bool> {
        match self.write()?.get_mut(id) {
            Some(row) => {
                row.attachment.cached_at = cached_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear_cached_at(&self) -> Result<usize> {
        let mut cleared = 0;
        for row in self.write()?.values_mut() {
            if row.attachment.cached_at.take().is_some() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    fn delete(&self, id: &AttachmentId) -> Result<bool> {
        Ok(self.write()?.remove(id).is_some())
    }

    fn delete_matching(&self, filter: &AttachmentFilter) -> Result<Vec<AttachmentId>> {
        let mut rows = self.write()?;
        let ids: Vec<AttachmentId> = rows
            .values()
            .filter(|row| filter.matches(&row.attachment))
            .map(|row| row.attachment.id)
            .collect();
        for id in &ids {
            rows.remove(id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::digest::DigestAlgorithm;

    fn saved(store: &InMemoryAttachmentStore, name: &str, content_type: &str) -> Attachment {
        let mut attachment = Attachment::new(name, Some(content_type.to_string()));
        let encoded = attachment
            .data(name.as_bytes(), Compression::None, DigestAlgorithm::Sha256)
            .unwrap();
        store.save(&attachment, &encoded).unwrap();
        attachment
    }

    #[test]
    fn test_save_get_delete() {
        let store = InMemoryAttachmentStore::new();
        let attachment = saved(&store, "a.txt", "text/plain");

        assert_eq!(store.get(&attachment.id).unwrap().unwrap().filename, "a.txt");
        let (loaded, encoded) = store.get_with_encoded(&attachment.id).unwrap().unwrap();
        assert_eq!(loaded.payload, attachment.payload);
        assert_eq!(encoded, b"a.txt");
        assert!(store.delete(&attachment.id).unwrap());
        assert!(store.get(&attachment.id).unwrap().is_none());
    }

    #[test]
    fn test_filter_and_delete_matching() {
        let store = InMemoryAttachmentStore::new();
        saved(&store, "a.txt", "text/plain");
        saved(&store, "b.png", "image/png");
        saved(&store, "c.txt", "text/plain");

        let filter = AttachmentFilter::content_type("text/plain");
        assert_eq!(store.count(&filter).unwrap(), 2);
        assert_eq!(store.delete_matching(&filter).unwrap().len(), 2);
        assert_eq!(store.count(&AttachmentFilter::all()).unwrap(), 1);
    }

    #[test]
    fn test_cached_at() {
        let store = InMemoryAttachmentStore::new();
        let attachment = saved(&store, "a", "text/plain");

        assert!(store.set_cached_at(&attachment.id, Some(Utc::now())).unwrap());
        assert!(store.get(&attachment.id).unwrap().unwrap().cached_at.is_some());
        assert_eq!(store.clear_cached_at().unwrap(), 1);
        assert_eq!(store.clear_cached_at().unwrap(), 0);
    }
}
