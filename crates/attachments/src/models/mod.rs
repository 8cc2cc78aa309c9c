//! Domain models for stored attachments

mod attachment;

pub use attachment::{Attachment, AttachmentId, Payload, WarmStatus};
