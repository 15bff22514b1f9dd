//! Message storage
//!
//! - [`message_store`]: per-message directories in lifecycle folders with
//!   staging-then-rename publication
//! - [`retention`]: periodic purge of messages past the storage horizon
//! - [`types`]: metadata, content and record documents

pub mod message_store;
pub mod retention;
pub mod types;

pub use message_store::{generate_id, stored_attachment_name, MessageStore, StoredEntry};
pub use retention::{RetentionSweeper, SweepReport};
pub use types::{
    AttachmentInfo, DeliveryReceipt, Envelope, FailureRecord, Folder, MessageContent,
    MessageListing, MessageMetadata, NewMessage, SessionInfo,
};
