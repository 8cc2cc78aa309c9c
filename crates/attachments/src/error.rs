//! Error types for attachment storage

use serde::Serialize;

use crate::models::AttachmentId;

/// Broad class of an [`AttachmentError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing settings; fatal at startup
    Configuration,
    /// Bad per-call argument such as an unknown algorithm name
    Validation,
    /// Corrupt blob, failed decode or digest mismatch
    Integrity,
    /// No attachment with the requested id
    NotFound,
    /// Filesystem or database failure
    Resource,
}

/// Errors surfaced by the attachment core
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Integrity error: {message}")]
    Integrity {
        id: Option<AttachmentId>,
        message: String,
    },

    #[error("Attachment not found: {0}")]
    NotFound(AttachmentId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AttachmentError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            id: None,
            message: message.into(),
        }
    }

    /// Attach the attachment id to an integrity error that doesn't carry one yet
    pub(crate) fn for_attachment(self, attachment: AttachmentId) -> Self {
        match self {
            Self::Integrity { id: None, message } => Self::Integrity {
                id: Some(attachment),
                message,
            },
            other => other,
        }
    }

    /// Which class of failure this is
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) | Self::Database(_) | Self::Migration(_) | Self::Storage(_) => {
                ErrorKind::Resource
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AttachmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(AttachmentError::config("x").kind(), ErrorKind::Configuration);
        assert_eq!(AttachmentError::invalid("x").kind(), ErrorKind::Validation);
        assert_eq!(AttachmentError::integrity("x").kind(), ErrorKind::Integrity);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(AttachmentError::from(io).kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_for_attachment_fills_id() {
        let id = AttachmentId::new();
        let err = AttachmentError::integrity("bad checksum").for_attachment(id);
        match err {
            AttachmentError::Integrity { id: Some(found), .. } => assert_eq!(found, id),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
