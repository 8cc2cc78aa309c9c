//! Storage traits and implementations
//!
//! The trait-based design allows swapping between in-memory and SQLite
//! storage for attachment metadata and encoded blobs.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryAttachmentStore;
pub use sqlite::SqliteAttachmentStore;
pub use traits::{AttachmentFilter, AttachmentStore};
