//! Disk cache of decompressed attachment payloads
//!
//! Directory structure:
//! ```text
//! cache/
//!   3f/
//!     3f2a9c0e4b8d4f1e9a7c6b5d4e3f2a1b.9f86d081884c7d65   # attachment 3f2a9c0e-..., digest 9f86d0...
//!   a0/
//!     a01b...
//! ```
//!
//! Entries are disposable: the durable blob can always rebuild them. An entry
//! is named after the attachment id and a prefix of the payload digest, so a
//! writer holding bytes of an older version can only produce a file that the
//! current metadata no longer points at. Writes go to a uniquely named temp
//! file in the shard directory and are renamed into place, so concurrent
//! writers for one key converge on a complete file and a reader never sees a
//! partial one. An entry's modification time is its cache time; pruning orders
//! by it.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::digest::Digest;
use crate::error::Result;
use crate::models::AttachmentId;
use crate::settings::Settings;

/// Prefix of in-flight temp files, which are never treated as entries
const TEMP_PREFIX: &str = ".tmp";

/// Temp files older than this belong to a writer that died
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Digest bytes encoded into an entry name
const VERSION_BYTES: usize = 8;

/// One version of one attachment's decompressed bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub id: AttachmentId,
    /// Lowercase hex prefix of the payload digest
    pub version: String,
}

impl CacheKey {
    pub fn new(id: AttachmentId, digest: &Digest) -> Self {
        let prefix = &digest.value[..digest.value.len().min(VERSION_BYTES)];
        Self {
            id,
            version: hex::encode(prefix),
        }
    }

    fn file_name(&self) -> String {
        format!("{}.{}", self.id.simple(), self.version)
    }

    /// Parse an entry file name, skipping temp files and strays
    fn parse(name: &str) -> Option<Self> {
        if name.starts_with(TEMP_PREFIX) {
            return None;
        }
        let (id, version) = name.split_once('.')?;
        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let id = Uuid::try_parse(id).ok()?;
        Some(Self {
            id: AttachmentId(id),
            version: version.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

fn shard_dir(root: &Path, id: &AttachmentId) -> PathBuf {
    root.join(&id.simple()[..2])
}

/// Deterministic cache location for one version of an attachment
pub fn cache_path(root: &Path, key: &CacheKey) -> PathBuf {
    shard_dir(root, &key.id).join(key.file_name())
}

/// One file in the cache
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

/// What a prune pass removed
#[derive(Debug, Clone, Default)]
pub struct PruneSummary {
    /// Entries removed for exceeding the age limit
    pub expired: Vec<CacheKey>,
    /// Entries removed to get under the size budget
    pub evicted: Vec<CacheKey>,
    pub reclaimed_bytes: u64,
    /// Bytes held by entries after pruning
    pub remaining_bytes: u64,
}

impl PruneSummary {
    /// Every key whose cache entry is gone
    pub fn removed(&self) -> impl Iterator<Item = &CacheKey> {
        self.expired.iter().chain(self.evicted.iter())
    }
}

/// Filesystem cache bounded by entry age and total size
#[derive(Debug, Clone)]
pub struct AttachmentCache {
    root: PathBuf,
    max_age: chrono::Duration,
    max_size: u64,
}

impl AttachmentCache {
    /// Create a cache rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>, max_age: chrono::Duration, max_size: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_age,
            max_size,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.cache_directory,
            settings.cache_max_age,
            settings.cache_max_size,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> chrono::Duration {
        self.max_age
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Where the entry for `key` lives (whether or not it exists)
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        cache_path(&self.root, key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path(key).is_file()
    }

    /// Open the entry for reading; `None` if it isn't cached.
    ///
    /// An open handle stays valid even if the entry is pruned meanwhile.
    pub fn open(&self, key: &CacheKey) -> Result<Option<File>> {
        match File::open(self.path(key)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the whole entry; `None` if it isn't cached
    pub fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let Some(mut file) = self.open(key)? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Atomically write the entry for `key`, replacing any existing one
    pub fn write(&self, key: &CacheKey, data: &[u8]) -> Result<PathBuf> {
        let path = self.path(key);
        let shard = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(shard)?;
        temp.write_all(data)?;
        temp.as_file().sync_data()?;
        temp.persist(&path).map_err(|e| e.error)?;

        Ok(path)
    }

    /// Reset the entry's cache time to now.
    ///
    /// Returns false if the entry is gone, e.g. pruned since it was read.
    pub fn touch(&self, key: &CacheKey) -> Result<bool> {
        let file = match File::options().write(true).open(self.path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.set_modified(SystemTime::now())?;
        Ok(true)
    }

    /// Remove the entry for `key`; returns whether one existed
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        remove_file_if_exists(&self.path(key))
    }

    /// Remove every version cached for `id`; returns how many were removed
    pub fn remove_all(&self, id: &AttachmentId) -> Result<usize> {
        let shard = shard_dir(&self.root, id);
        let dir = match fs::read_dir(&shard) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let matches = name
                .to_str()
                .and_then(CacheKey::parse)
                .is_some_and(|key| key.id == *id);
            if matches && remove_file_if_exists(&entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All entries currently on disk.
    ///
    /// Files that vanish during the scan are skipped.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for file in self.files() {
            let (path, metadata) = match file {
                Ok(found) => found,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(key) = entry_key(&path) else {
                continue;
            };
            entries.push(CacheEntry {
                key,
                path,
                size: metadata.len(),
                cached_at: metadata.modified()?.into(),
            });
        }
        Ok(entries)
    }

    /// Total bytes of every file under the cache root
    pub fn size(&self) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            match file {
                Ok((_, metadata)) => total += metadata.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Apply the age policy, then the size policy, relative to now
    pub fn prune(&self) -> Result<PruneSummary> {
        self.prune_at(Utc::now())
    }

    /// Apply the age policy, then the size policy, relative to `now`.
    ///
    /// Entries cached strictly before `now - max_age` are removed first. If
    /// the remainder still exceeds `max_size`, entries are evicted oldest
    /// first until it doesn't. Entries that can't be removed are logged and
    /// skipped.
    pub fn prune_at(&self, now: DateTime<Utc>) -> Result<PruneSummary> {
        let cutoff = now - self.max_age;
        let mut entries = self.entries()?;
        entries.sort_by_key(|entry| entry.cached_at);

        let mut summary = PruneSummary::default();
        let (expired, live): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.cached_at < cutoff);

        for entry in expired {
            if self.evict(&entry) {
                summary.reclaimed_bytes += entry.size;
                summary.expired.push(entry.key);
            }
        }

        let mut remaining: u64 = live.iter().map(|entry| entry.size).sum();
        let mut undeletable = 0;
        for entry in live {
            if remaining <= self.max_size {
                break;
            }
            if self.evict(&entry) {
                remaining -= entry.size;
                summary.reclaimed_bytes += entry.size;
                summary.evicted.push(entry.key);
            } else {
                undeletable += entry.size;
            }
        }
        summary.remaining_bytes = remaining;

        if remaining > self.max_size {
            log::warn!(
                "[CACHE] Cache still holds {} bytes over a {} byte budget ({} bytes could not be removed)",
                remaining,
                self.max_size,
                undeletable
            );
        }
        log::info!(
            "[CACHE] Pruned {} expired and {} evicted entries, reclaimed {} bytes",
            summary.expired.len(),
            summary.evicted.len(),
            summary.reclaimed_bytes
        );

        Ok(summary)
    }

    /// Remove every entry and any stray files; returns the keys removed.
    ///
    /// Temp files of writers still in flight are left alone; only ones older
    /// than an hour are swept.
    pub fn clear(&self) -> Result<Vec<CacheKey>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();
        for file in self.files() {
            let (path, metadata) = match file {
                Ok(found) => found,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if is_temp(&path) && !is_stale(&metadata, now) {
                continue;
            }
            if remove_file_if_exists(&path)? {
                if let Some(key) = entry_key(&path) {
                    removed.push(key);
                }
            }
        }
        log::info!("[CACHE] Cleared {} entries", removed.len());
        Ok(removed)
    }

    /// Remove one entry during pruning, logging instead of failing
    fn evict(&self, entry: &CacheEntry) -> bool {
        match remove_file_if_exists(&entry.path) {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("[CACHE] Failed to evict {}: {}", entry.path.display(), e);
                false
            }
        }
    }

    /// Regular files in the shard directories, with their metadata
    fn files(&self) -> impl Iterator<Item = io::Result<(PathBuf, fs::Metadata)>> + '_ {
        WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() => Some(
                    entry
                        .metadata()
                        .map(|metadata| (entry.into_path(), metadata))
                        .map_err(io::Error::from),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::from(e))),
            })
    }
}

fn entry_key(path: &Path) -> Option<CacheKey> {
    CacheKey::parse(path.file_name()?.to_str()?)
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

fn is_stale(metadata: &fs::Metadata, now: SystemTime) -> bool {
    metadata
        .modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > STALE_TEMP_AGE)
}

fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
