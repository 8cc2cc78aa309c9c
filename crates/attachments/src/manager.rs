//! Bulk cache administration
//!
//! Warm, prune, clear and delete across every attachment matching a filter.
//! Each attachment is processed on its own; a failure on one never leaves
//! another half done.

use std::ops::ControlFlow;

use rayon::prelude::*;
use serde::Serialize;

use crate::cache::PruneSummary;
use crate::error::{ErrorKind, Result};
use crate::models::{Attachment, AttachmentId};
use crate::service::{Attachments, WarmReport};
use crate::storage::AttachmentFilter;

/// One row of a cache listing
#[derive(Debug, Clone, Serialize)]
pub struct CacheListing {
    pub attachment: Attachment,
    /// Whether a decompressed copy is on disk right now
    pub on_disk: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmFailure {
    pub id: AttachmentId,
    pub filename: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of warming one attachment during a bulk pass
pub type WarmResult = std::result::Result<WarmReport, WarmFailure>;

/// What a bulk warm did
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmSummary {
    pub reports: Vec<WarmReport>,
    pub failures: Vec<WarmFailure>,
}

impl WarmSummary {
    fn push(&mut self, result: WarmResult) {
        match result {
            Ok(report) => self.reports.push(report),
            Err(failure) => self.failures.push(failure),
        }
    }
}

/// Cache administration over an [`Attachments`] service
pub struct CacheManager<'a> {
    attachments: &'a Attachments,
}

impl<'a> CacheManager<'a> {
    pub fn new(attachments: &'a Attachments) -> Self {
        Self { attachments }
    }

    /// Attachments matching `filter`, optionally only those cached on disk
    pub fn list(&self, filter: &AttachmentFilter, on_disk_only: bool) -> Result<Vec<CacheListing>> {
        let cache = self.attachments.cache();
        Ok(self
            .attachments
            .store()
            .list(filter)?
            .into_iter()
            .map(|attachment| {
                let on_disk = attachment
                    .cache_key()
                    .is_ok_and(|key| cache.contains(&key));
                CacheListing { attachment, on_disk }
            })
            .filter(|listing| listing.on_disk || !on_disk_only)
            .collect())
    }

    fn warm_one(&self, attachment: Attachment) -> WarmResult {
        let id = attachment.id;
        let filename = attachment.filename.clone();
        self.attachments.warm_attachment(attachment).map_err(|e| {
            log::warn!("[CACHE] Failed to warm {} ({}): {}", filename, id, e);
            WarmFailure {
                id,
                filename,
                kind: e.kind(),
                message: e.to_string(),
            }
        })
    }

    /// Warm every matching attachment on the rayon pool
    pub fn warm_all(&self, filter: &AttachmentFilter) -> Result<WarmSummary> {
        let attachments = self.attachments.store().list(filter)?;
        let results: Vec<WarmResult> = attachments
            .into_par_iter()
            .map(|attachment| self.warm_one(attachment))
            .collect();

        let mut summary = WarmSummary::default();
        for result in results {
            summary.push(result);
        }
        log::info!(
            "[CACHE] Warmed {} attachments, {} failed",
            summary.reports.len(),
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Warm matching attachments one at a time.
    ///
    /// `on_result` sees each outcome as it happens and can stop the pass by
    /// returning `ControlFlow::Break`.
    pub fn warm_each<F>(&self, filter: &AttachmentFilter, mut on_result: F) -> Result<WarmSummary>
    where
        F: FnMut(&WarmResult) -> ControlFlow<()>,
    {
        let mut summary = WarmSummary::default();
        for attachment in self.attachments.store().list(filter)? {
            let result = self.warm_one(attachment);
            let flow = on_result(&result);
            summary.push(result);
            if flow.is_break() {
                break;
            }
        }
        Ok(summary)
    }

    /// Apply the cache's age and size policies and forget evicted cache times.
    ///
    /// Removing an entry for superseded data leaves the current cache time alone.
    pub fn prune(&self) -> Result<PruneSummary> {
        let summary = self.attachments.cache().prune()?;
        let store = self.attachments.store();
        for key in summary.removed() {
            let Some(current) = store.get(&key.id)? else {
                continue;
            };
            if current.cache_key().is_ok_and(|current| current == *key) {
                store.set_cached_at(&key.id, None)?;
            }
        }
        Ok(summary)
    }

    /// Remove every cache entry; returns how many were removed
    pub fn clear(&self) -> Result<usize> {
        let removed = self.attachments.cache().clear()?;
        self.attachments.store().clear_cached_at()?;
        Ok(removed.len())
    }

    /// Bytes currently used by the cache
    pub fn size(&self) -> Result<u64> {
        self.attachments.cache().size()
    }

    /// Delete matching attachments and their cache entries
    pub fn delete_matching(&self, filter: &AttachmentFilter) -> Result<usize> {
        let ids = self.attachments.store().delete_matching(filter)?;
        let cache = self.attachments.cache();
        for id in &ids {
            if let Err(e) = cache.remove_all(id) {
                log::warn!("[CACHE] Failed to remove cached copy of {}: {}", id, e);
            }
        }
        log::info!("[ATTACH] Deleted {} attachments", ids.len());
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DatabaseLocation, Settings};
    use crate::storage::InMemoryAttachmentStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_service(max_size: u64) -> (Attachments, TempDir) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new(DatabaseLocation::Memory)
            .with_cache_directory(dir.path().join("cache"))
            .with_cache_max_size(max_size);
        let service =
            Attachments::with_store(settings, Arc::new(InMemoryAttachmentStore::new())).unwrap();
        (service, dir)
    }

    fn populate(service: &Attachments) -> Vec<Attachment> {
        vec![
            service
                .create("a.txt", Some("text/plain".into()), &[b'a'; 100], None, None)
                .unwrap(),
            service
                .create("b.png", Some("image/png".into()), &[b'b'; 100], Some("gzip"), None)
                .unwrap(),
            service
                .create("c.txt", Some("text/plain".into()), &[b'c'; 100], Some("lzma"), None)
                .unwrap(),
        ]
    }

    #[test]
    fn test_warm_all_and_list() {
        let (service, _dir) = create_test_service(1 << 20);
        populate(&service);
        let manager = service.cache_manager();

        assert!(manager.list(&AttachmentFilter::all(), true).unwrap().is_empty());

        let summary = manager
            .warm_all(&AttachmentFilter::content_type("text/plain"))
            .unwrap();
        assert_eq!(summary.reports.len(), 2);
        assert!(summary.failures.is_empty());

        let on_disk = manager.list(&AttachmentFilter::all(), true).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk.iter().all(|l| l.attachment.content_type.as_deref() == Some("text/plain")));
        assert_eq!(manager.size().unwrap(), 200);
    }

    #[test]
    fn test_warm_all_reports_failures() {
        let (service, _dir) = create_test_service(1 << 20);
        let attachments = populate(&service);
        service
            .store()
            .save(&attachments[1], b"not a gzip stream")
            .unwrap();

        let summary = service.cache_manager().warm_all(&AttachmentFilter::all()).unwrap();

        assert_eq!(summary.reports.len(), 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].id, attachments[1].id);
        assert_eq!(summary.failures[0].kind, ErrorKind::Integrity);
    }

    #[test]
    fn test_warm_each_can_stop() {
        let (service, _dir) = create_test_service(1 << 20);
        populate(&service);

        let mut seen = 0;
        let summary = service
            .cache_manager()
            .warm_each(&AttachmentFilter::all(), |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(service.cache().entries().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_resets_cached_at() {
        let (service, _dir) = create_test_service(150);
        let attachments = populate(&service);
        let manager = service.cache_manager();
        manager.warm_all(&AttachmentFilter::all()).unwrap();

        let summary = manager.prune().unwrap();

        assert_eq!(summary.removed().count(), 2);
        assert!(manager.size().unwrap() <= 150);
        for key in summary.removed() {
            assert!(service.get(&key.id).unwrap().cached_at.is_none());
        }
        for attachment in &attachments {
            assert_eq!(service.read(&attachment.id).unwrap().len(), 100);
        }
    }

    #[test]
    fn test_prune_of_superseded_entry_keeps_cache_time() {
        let (service, _dir) = create_test_service(6);
        let attachment = service.create("a", None, b"first", None, None).unwrap();
        let old_key = attachment.cache_key().unwrap();
        service.replace(&attachment.id, b"second", None, None).unwrap();
        service.warm(&attachment.id).unwrap();

        // A late writer left an older entry for the first version
        service.cache().write(&old_key, b"first").unwrap();
        let file = std::fs::File::options()
            .write(true)
            .open(service.cache().path(&old_key))
            .unwrap();
        file.set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(3600))
            .unwrap();

        let summary = service.cache_manager().prune().unwrap();

        assert_eq!(summary.evicted, vec![old_key]);
        assert!(service.get(&attachment.id).unwrap().cached_at.is_some());
        assert!(service.is_cached(&attachment.id).unwrap());
    }

    #[test]
    fn test_clear_then_read_falls_back() {
        let (service, _dir) = create_test_service(1 << 20);
        let attachments = populate(&service);
        let manager = service.cache_manager();
        manager.warm_all(&AttachmentFilter::all()).unwrap();

        assert_eq!(manager.clear().unwrap(), 3);
        assert_eq!(manager.size().unwrap(), 0);
        assert!(service.get(&attachments[0].id).unwrap().cached_at.is_none());
        assert_eq!(service.read(&attachments[0].id).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn test_delete_matching_removes_cache_entries() {
        let (service, _dir) = create_test_service(1 << 20);
        let attachments = populate(&service);
        let manager = service.cache_manager();
        manager.warm_all(&AttachmentFilter::all()).unwrap();

        let deleted = manager
            .delete_matching(&AttachmentFilter::content_type("text/plain"))
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(service.get(&attachments[0].id).is_err());
        assert!(service.is_cached(&attachments[1].id).unwrap());
        assert_eq!(service.cache().entries().unwrap().len(), 1);
        assert_eq!(manager.list(&AttachmentFilter::all(), false).unwrap().len(), 1);
    }
}
