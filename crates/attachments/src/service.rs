//! Attachment service: ties the store, the codecs and the cache together
//!
//! This is the entry point for delivery code ("store these bytes", "give me a
//! reader for attachment X") and the layer the cache manager drives.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::cache::{AttachmentCache, CacheKey};
use crate::compression::Compression;
use crate::digest::DigestAlgorithm;
use crate::error::{AttachmentError, Result};
use crate::manager::CacheManager;
use crate::models::{Attachment, AttachmentId, WarmStatus};
use crate::settings::Settings;
use crate::storage::{AttachmentStore, SqliteAttachmentStore};

/// A request to import one file
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    /// Replace the data of an existing attachment with the same filename
    pub overwrite: bool,
    pub compression: Option<String>,
    pub digest_algorithm: Option<String>,
}

impl ImportRequest {
    /// Import `data` read from `path`.
    ///
    /// The stored filename is the final component of `name` if given,
    /// otherwise of `path`.
    pub fn from_path(path: &Path, name: Option<&str>, data: Vec<u8>) -> Result<Self> {
        let source = name.map(Path::new).unwrap_or(path);
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                AttachmentError::invalid(format!("no usable file name in {}", source.display()))
            })?
            .to_string();

        Ok(Self {
            filename,
            content_type: None,
            data,
            overwrite: false,
            compression: None,
            digest_algorithm: None,
        })
    }
}

/// What an import did
#[derive(Debug, Clone)]
pub enum ImportOutcome {
    Imported(Attachment),
    /// Existing attachment kept its id and received the new data
    Replaced(Attachment),
    /// An attachment with this filename exists and overwrite was off
    Skipped { existing: Attachment },
}

/// Result of warming one attachment
#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub attachment: Attachment,
    pub status: WarmStatus,
}

enum ContentReader {
    Cached(File),
    Memory(Cursor<Vec<u8>>),
}

/// Readable content of one attachment
///
/// Either an open handle on the cache entry or the freshly decoded bytes.
pub struct AttachmentContent {
    pub attachment: Attachment,
    reader: ContentReader,
}

impl AttachmentContent {
    /// Whether the bytes are being served from the cache
    pub fn is_cached(&self) -> bool {
        matches!(self.reader, ContentReader::Cached(_))
    }

    /// Read the remaining content into memory
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.reader {
            ContentReader::Memory(cursor) => {
                let position = cursor.position() as usize;
                let mut data = cursor.into_inner();
                data.drain(..position);
                Ok(data)
            }
            ContentReader::Cached(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }
}

impl Read for AttachmentContent {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            ContentReader::Cached(file) => file.read(buf),
            ContentReader::Memory(cursor) => cursor.read(buf),
        }
    }
}

/// Attachment storage with a decompressed disk cache
pub struct Attachments {
    settings: Settings,
    store: Arc<dyn AttachmentStore>,
    cache: AttachmentCache,
}

impl Attachments {
    /// Open the SQLite store and cache described by `settings`
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let store = SqliteAttachmentStore::open(&settings.database_location)?;
        Self::with_store(settings, Arc::new(store))
    }

    /// Use an existing store
    pub fn with_store(settings: Settings, store: Arc<dyn AttachmentStore>) -> Result<Self> {
        settings.ensure_cache_directory()?;
        let cache = AttachmentCache::from_settings(&settings)?;
        Ok(Self {
            settings,
            store,
            cache,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &dyn AttachmentStore {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &AttachmentCache {
        &self.cache
    }

    /// Bulk cache administration over this service
    pub fn cache_manager(&self) -> CacheManager<'_> {
        CacheManager::new(self)
    }

    fn resolve_algorithms(
        &self,
        compression: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<(Compression, DigestAlgorithm)> {
        Ok((
            Compression::select(compression, self.settings.compression)?,
            DigestAlgorithm::select(digest_algorithm, self.settings.digest_algorithm)?,
        ))
    }

    /// Encode `data` into `attachment` and persist both atomically.
    ///
    /// The caller's value is only updated once the store has committed.
    fn persist_data(
        &self,
        attachment: &mut Attachment,
        data: &[u8],
        compression: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<()> {
        let (compression, digest_algorithm) =
            self.resolve_algorithms(compression, digest_algorithm)?;

        let mut updated = attachment.clone();
        let encoded = updated.data(data, compression, digest_algorithm)?;
        self.store.save(&updated, &encoded)?;

        // Older versions are unreachable now; reclaim the space early
        if let Err(e) = self.cache.remove_all(&updated.id) {
            log::warn!("[ATTACH] Failed to drop stale cache entry for {}: {}", updated.id, e);
        }

        *attachment = updated;
        Ok(())
    }

    /// Store `data` as a new attachment
    pub fn create(
        &self,
        filename: impl Into<String>,
        content_type: Option<String>,
        data: &[u8],
        compression: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<Attachment> {
        let mut attachment = Attachment::new(filename, content_type);
        self.persist_data(&mut attachment, data, compression, digest_algorithm)?;
        log::info!(
            "[ATTACH] Stored {} as {} ({} bytes)",
            attachment.filename,
            attachment.id,
            data.len()
        );
        Ok(attachment)
    }

    /// Replace the data of an existing attachment, keeping its id
    pub fn replace(
        &self,
        id: &AttachmentId,
        data: &[u8],
        compression: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<Attachment> {
        let mut attachment = self.get(id)?;
        self.persist_data(&mut attachment, data, compression, digest_algorithm)?;
        Ok(attachment)
    }

    /// Import a file, honoring the overwrite flag for duplicate filenames
    pub fn import(&self, request: ImportRequest) -> Result<ImportOutcome> {
        let compression = request.compression.as_deref();
        let digest_algorithm = request.digest_algorithm.as_deref();
        // Fail on bad names before touching anything
        self.resolve_algorithms(compression, digest_algorithm)?;

        match self.store.find_by_filename(&request.filename)? {
            Some(existing) if !request.overwrite => {
                log::info!("[ATTACH] Skipping {}, already stored", request.filename);
                Ok(ImportOutcome::Skipped { existing })
            }
            Some(mut existing) => {
                if request.content_type.is_some() {
                    existing.content_type = request.content_type;
                }
                self.persist_data(&mut existing, &request.data, compression, digest_algorithm)?;
                Ok(ImportOutcome::Replaced(existing))
            }
            None => {
                let attachment = self.create(
                    request.filename,
                    request.content_type,
                    &request.data,
                    compression,
                    digest_algorithm,
                )?;
                Ok(ImportOutcome::Imported(attachment))
            }
        }
    }

    /// Get attachment metadata
    pub fn get(&self, id: &AttachmentId) -> Result<Attachment> {
        self.store.get(id)?.ok_or(AttachmentError::NotFound(*id))
    }

    /// Metadata and blob read together
    fn snapshot(&self, id: &AttachmentId) -> Result<(Attachment, Vec<u8>)> {
        self.store
            .get_with_encoded(id)?
            .ok_or(AttachmentError::NotFound(*id))
    }

    /// Open the content of an attachment for reading.
    ///
    /// Serves the cache entry when it looks intact, otherwise decodes the
    /// durable blob and tries to cache the result. Failing to write the cache
    /// is logged and the decoded bytes are served from memory.
    pub fn open(&self, id: &AttachmentId) -> Result<AttachmentContent> {
        let attachment = self.get(id)?;
        let key = attachment.cache_key()?;

        if let Some(reader) = self.open_cached(&attachment, &key) {
            return Ok(AttachmentContent { attachment, reader });
        }

        // The row may have changed since `get`; decode whatever is current
        let (mut attachment, encoded) = self.snapshot(id)?;
        let decoded = attachment.decode(&encoded)?;
        let key = attachment.cache_key()?;

        match self.cache.write(&key, &decoded) {
            Ok(_) => {
                let now = Utc::now();
                match self.store.set_cached_at(id, Some(now)) {
                    Ok(true) => attachment.cached_at = Some(now),
                    Ok(false) => self.discard(&key),
                    Err(e) => log::warn!("[ATTACH] Failed to record cache time for {}: {}", id, e),
                }
            }
            Err(e) => log::warn!("[CACHE] Serving {} uncached, cache write failed: {}", id, e),
        }

        Ok(AttachmentContent {
            attachment,
            reader: ContentReader::Memory(Cursor::new(decoded)),
        })
    }

    /// Cache hit path; `None` means the caller must decode
    fn open_cached(&self, attachment: &Attachment, key: &CacheKey) -> Option<ContentReader> {
        let id = &attachment.id;
        let mut file = match self.cache.open(key) {
            Ok(Some(file)) => file,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("[CACHE] Could not open cached copy of {}: {}", id, e);
                return None;
            }
        };

        if self.settings.verify_cache_reads {
            let mut data = Vec::new();
            if let Err(e) = file.read_to_end(&mut data) {
                log::warn!("[CACHE] Could not read cached copy of {}: {}", id, e);
                return None;
            }
            if attachment.verify(&data) {
                return Some(ContentReader::Memory(Cursor::new(data)));
            }
        } else {
            let size_ok = file
                .metadata()
                .is_ok_and(|m| Some(m.len()) == attachment.size());
            if size_ok {
                return Some(ContentReader::Cached(file));
            }
        }

        log::warn!("[CACHE] Discarding corrupt cached copy of {}", id);
        self.discard(key);
        None
    }

    fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.cache.remove(key) {
            log::warn!("[CACHE] Failed to remove cached copy {}: {}", key, e);
        }
    }

    /// Read the whole content of an attachment
    pub fn read(&self, id: &AttachmentId) -> Result<Vec<u8>> {
        self.open(id)?.into_bytes()
    }

    /// Materialize the cache entry for one attachment
    pub fn warm(&self, id: &AttachmentId) -> Result<WarmReport> {
        self.warm_attachment(self.get(id)?)
    }

    pub(crate) fn warm_attachment(&self, mut attachment: Attachment) -> Result<WarmReport> {
        let id = attachment.id;
        let status = attachment.warm(&self.cache, || self.snapshot(&id))?;
        if !self.store.set_cached_at(&id, attachment.cached_at)? {
            // Deleted while warming; don't leave the entry behind
            if let Err(e) = self.cache.remove_all(&id) {
                log::warn!("[CACHE] Failed to remove cached copy of {}: {}", id, e);
            }
            return Err(AttachmentError::NotFound(id));
        }
        Ok(WarmReport { attachment, status })
    }

    /// Where the cache entry for the current data of `id` lives; it may not
    /// exist. The path changes whenever the data does.
    pub fn cached_filepath(&self, id: &AttachmentId) -> Result<PathBuf> {
        Ok(self.cache.path(&self.get(id)?.cache_key()?))
    }

    /// Whether the current data of `id` is cached
    pub fn is_cached(&self, id: &AttachmentId) -> Result<bool> {
        Ok(self.cache.contains(&self.get(id)?.cache_key()?))
    }

    /// Delete an attachment and its cache entries; returns whether it existed
    pub fn delete(&self, id: &AttachmentId) -> Result<bool> {
        let existed = self.store.delete(id)?;
        if let Err(e) = self.cache.remove_all(id) {
            log::warn!("[CACHE] Failed to remove cached copy of {}: {}", id, e);
        }
        if existed {
            log::info!("[ATTACH] Deleted {}", id);
        }
        Ok(existed)
    }
}
