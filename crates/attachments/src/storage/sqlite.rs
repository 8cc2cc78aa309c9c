//! SQLite-based attachment storage with encoded payloads stored inline

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::traits::{AttachmentFilter, AttachmentStore};
use crate::compression::Compression;
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{AttachmentError, Result};
use crate::models::{Attachment, AttachmentId, Payload};
use crate::settings::DatabaseLocation;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE attachments (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                content_type TEXT,
                created_at TEXT NOT NULL,
                size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                compression TEXT NOT NULL,
                digest_algorithm TEXT NOT NULL,
                digest BLOB NOT NULL,     -- digest of the original bytes
                data BLOB NOT NULL,       -- encoded with `compression`
                cached_at TEXT
            );

            CREATE INDEX idx_attachments_filename ON attachments(filename);
            CREATE INDEX idx_attachments_content_type ON attachments(content_type);
            CREATE INDEX idx_attachments_created_at ON attachments(created_at ASC);
            "#,
        ),
    ])
}

/// Metadata columns, in the order `attachment_from_row` reads them
const COLUMNS: &str = "id, filename, content_type, created_at, size, compressed_size, \
                       compression, digest_algorithm, digest, cached_at";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn read_size(row: &Row<'_>, column: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Integer,
            format!("negative size {value}").into(),
        )
    })
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, format!("bad timestamp {value:?}: {e}")))
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let id: String = row.get(0)?;
    let id = id
        .parse::<AttachmentId>()
        .map_err(|e| conversion_error(0, e.to_string()))?;
    let created_at: String = row.get(3)?;
    let compression: String = row.get(6)?;
    let digest_algorithm: String = row.get(7)?;
    let cached_at: Option<String> = row.get(9)?;

    let payload = Payload {
        size: read_size(row, 4)?,
        compressed_size: read_size(row, 5)?,
        compression: compression
            .parse::<Compression>()
            .map_err(|e| conversion_error(6, e.to_string()))?,
        digest: Digest {
            algorithm: digest_algorithm
                .parse::<DigestAlgorithm>()
                .map_err(|e| conversion_error(7, e.to_string()))?,
            value: row.get(8)?,
        },
    };

    Ok(Attachment {
        id,
        filename: row.get(1)?,
        content_type: row.get(2)?,
        created_at: parse_timestamp(3, &created_at)?,
        payload: Some(payload),
        cached_at: cached_at
            .as_deref()
            .map(|value| parse_timestamp(9, value))
            .transpose()?,
    })
}

/// WHERE clause and its parameters for a filter
fn filter_clause(filter: &AttachmentFilter) -> (String, Vec<&str>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(content_type) = &filter.content_type {
        conditions.push("content_type = ?");
        values.push(content_type.as_str());
    }
    if let Some(filename) = &filter.filename {
        conditions.push("filename = ?");
        values.push(filename.as_str());
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

/// SQLite-based attachment storage
///
/// Metadata and the encoded blob share a row, so a single statement updates
/// both atomically.
pub struct SqliteAttachmentStore {
    conn: Mutex<Connection>,
}

impl SqliteAttachmentStore {
    /// Open (creating if needed) the database at `location`
    pub fn open(location: &DatabaseLocation) -> Result<Self> {
        match location {
            DatabaseLocation::Memory => Self::in_memory(),
            DatabaseLocation::File(path) => Self::new(path),
        }
    }

    /// Open (creating if needed) a database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        log::debug!("[STORE] Opened attachment database at {}", db_path.display());
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed while a writer commits; the busy timeout
        // covers other processes sharing the same file.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations().to_latest(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AttachmentError::Storage("database connection lock poisoned".into()))
    }
}

impl AttachmentStore for SqliteAttachmentStore {
    fn save(&self, attachment: &Attachment, encoded: &[u8]) -> Result<()> {
        let payload = attachment.payload.as_ref().ok_or_else(|| {
            AttachmentError::invalid(format!(
                "cannot save attachment {} before data is set",
                attachment.id
            ))
        })?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO attachments (id, filename, content_type, created_at, size,
                                      compressed_size, compression, digest_algorithm,
                                      digest, data, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size = excluded.size,
                compressed_size = excluded.compressed_size,
                compression = excluded.compression,
                digest_algorithm = excluded.digest_algorithm,
                digest = excluded.digest,
                data = excluded.data,
                cached_at = excluded.cached_at",
            params![
                attachment.id.to_string(),
                attachment.filename,
                attachment.content_type,
                attachment.created_at.to_rfc3339(),
                payload.size as i64,
                payload.compressed_size as i64,
                payload.compression.name(),
                payload.digest.algorithm.name(),
                payload.digest.value,
                encoded,
                attachment.cached_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "[STORE] Saved attachment {} ({} -> {} bytes, {})",
            attachment.id,
            payload.size,
            payload.compressed_size,
            payload.compression
        );
        Ok(())
    }

    fn get(&self, id: &AttachmentId) -> Result<Option<Attachment>> {
        let conn = self.lock()?;
        let attachment = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM attachments WHERE id = ?"),
                [id.to_string()],
                attachment_from_row,
            )
            .optional()?;
        Ok(attachment)
    }

    fn get_with_encoded(&self, id: &AttachmentId) -> Result<Option<(Attachment, Vec<u8>)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS}, data FROM attachments WHERE id = ?"),
                [id.to_string()],
                |row| Ok((attachment_from_row(row)?, row.get(10)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn list(&self, filter: &AttachmentFilter) -> Result<Vec<Attachment>> {
        let conn = self.lock()?;
        let (clause, values) = filter_clause(filter);
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM attachments{clause} ORDER BY created_at ASC, id ASC"
        ))?;
        let attachments = stmt
            .query_map(params_from_iter(values), attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn count(&self, filter: &AttachmentFilter) -> Result<usize> {
        let conn = self.lock()?;
        let (clause, values) = filter_clause(filter);
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM attachments{clause}"),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn set_cached_at(&self, id: &AttachmentId, cached_at: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE attachments SET cached_at = ? WHERE id = ?",
            params![cached_at.map(|t| t.to_rfc3339()), id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn clear_cached_at(&self) -> Result<usize> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE attachments SET cached_at = NULL WHERE cached_at IS NOT NULL",
            [],
        )?;
        Ok(updated)
    }

    fn delete(&self, id: &AttachmentId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM attachments WHERE id = ?", [id.to_string()])?;
        Ok(deleted > 0)
    }

    fn delete_matching(&self, filter: &AttachmentFilter) -> Result<Vec<AttachmentId>> {
        let mut conn = self.lock()?;
        let (clause, values) = filter_clause(filter);
        let tx = conn.transaction()?;

        let ids = {
            let mut stmt = tx.prepare(&format!("SELECT id FROM attachments{clause}"))?;
            stmt.query_map(params_from_iter(values.iter()), |row| {
                let id: String = row.get(0)?;
                id.parse::<AttachmentId>()
                    .map_err(|e| conversion_error(0, e.to_string()))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            &format!("DELETE FROM attachments{clause}"),
            params_from_iter(values.iter()),
        )?;
        tx.commit()?;

        log::info!("[STORE] Deleted {} attachments", ids.len());
        Ok(ids)
    }
}
