//! Attachments crate - Compressed file storage with a disk cache
//!
//! This crate provides the storage core for file attachments:
//! - Digest and compression engines (closed enums over named algorithms)
//! - The attachment record and its encode/verify/warm lifecycle
//! - A sharded disk cache of decompressed payloads, bounded by age and size
//! - Storage trait abstractions with SQLite and in-memory backends
//! - The `Attachments` service and its bulk cache manager
//!
//! The durable compressed blob is the source of truth; every cache entry can
//! be rebuilt from it.

pub mod cache;
pub mod compression;
pub mod digest;
pub mod error;
pub mod manager;
pub mod models;
pub mod service;
pub mod settings;
pub mod storage;

pub use cache::{AttachmentCache, CacheEntry, CacheKey, PruneSummary, cache_path};
pub use compression::Compression;
pub use digest::{Digest, DigestAlgorithm};
pub use error::{AttachmentError, ErrorKind, Result};
pub use manager::{CacheListing, CacheManager, WarmFailure, WarmResult, WarmSummary};
pub use models::{Attachment, AttachmentId, Payload, WarmStatus};
pub use service::{AttachmentContent, Attachments, ImportOutcome, ImportRequest, WarmReport};
pub use settings::{DatabaseLocation, Settings};
pub use storage::{AttachmentFilter, AttachmentStore, InMemoryAttachmentStore, SqliteAttachmentStore};
