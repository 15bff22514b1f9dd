//! Lifecycle-folder message storage
//!
//! # Layout
//! ```text
//! <root>/
//!   tmp/<id>/          staging, renamed into incoming/ once complete
//!   incoming/<id>/     accepted, possibly queued for delivery
//!   sent/<id>/         delivered (receipt.json)
//!   failed/<id>/       retries exhausted (failure.json)
//!
//! <id>/metadata.json
//! <id>/content.json
//! <id>/attachments/<stored name>
//! ```
//!
//! A message directory only ever appears in a lifecycle folder through a
//! rename, so readers never observe metadata without its content and a
//! message is never in two folders at once.

use crate::error::{RelayError, Result};
use crate::storage::types::{
    AttachmentInfo, DeliveryReceipt, FailureRecord, Folder, MessageContent, MessageMetadata,
    NewMessage,
};
use crate::utils::write_atomic;
use data_encoding::HEXLOWER;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const CONTENT_FILE: &str = "content.json";
const ATTACHMENTS_DIR: &str = "attachments";
const RECEIPT_FILE: &str = "receipt.json";
const FAILURE_FILE: &str = "failure.json";
const STAGING_DIR: &str = "tmp";

/// A message directory found while scanning a folder
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

pub struct MessageStore {
    base_path: PathBuf,
}

impl MessageStore {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the folder structure and discard half-written staging directories
    pub async fn init(&self) -> Result<()> {
        for folder in Folder::ALL {
            self.ensure_dir(&self.folder_path(folder)).await?;
        }

        let staging = self.base_path.join(STAGING_DIR);
        if staging.exists() {
            let mut entries = fs::read_dir(&staging).await?;
            while let Some(entry) = entries.next_entry().await? {
                warn!("Removing stale staging entry {:?}", entry.path());
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!("Failed to remove {:?}: {}", entry.path(), e);
                }
            }
        }
        self.ensure_dir(&staging).await?;

        Ok(())
    }

    pub fn folder_path(&self, folder: Folder) -> PathBuf {
        self.base_path.join(folder.as_str())
    }

    pub fn message_dir(&self, folder: Folder, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.folder_path(folder).join(id))
    }

    /// Persist a newly accepted message into `incoming`
    pub async fn save_incoming(&self, message: &NewMessage) -> Result<PathBuf> {
        let id = &message.metadata.id;
        validate_id(id)?;

        if message.metadata.attachments.len() != message.attachment_data.len() {
            return Err(RelayError::Storage(format!(
                "Attachment count mismatch for message {}",
                id
            )));
        }

        let staging = self.base_path.join(STAGING_DIR).join(id);
        let target = self.folder_path(Folder::Incoming).join(id);

        if target.exists() {
            return Err(RelayError::Storage(format!("Message {} already exists", id)));
        }

        if let Err(e) = self.write_staging(&staging, message).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(RelayError::Storage(format!(
                "Failed to publish message {}: {}",
                id, e
            )));
        }

        info!("Stored message {} in {}", id, Folder::Incoming);
        Ok(target)
    }

    async fn write_staging(&self, staging: &Path, message: &NewMessage) -> Result<()> {
        fs::create_dir_all(staging).await.map_err(|e| {
            RelayError::Storage(format!("Failed to create directory {:?}: {}", staging, e))
        })?;

        let metadata = serde_json::to_vec_pretty(&message.metadata)?;
        write_atomic(&staging.join(METADATA_FILE), &metadata).await?;

        let content = serde_json::to_vec_pretty(&message.content)?;
        write_atomic(&staging.join(CONTENT_FILE), &content).await?;

        if !message.attachment_data.is_empty() {
            let dir = staging.join(ATTACHMENTS_DIR);
            fs::create_dir_all(&dir).await?;
            for (info, data) in message.metadata.attachments.iter().zip(&message.attachment_data) {
                validate_stored_name(&info.stored_name)?;
                fs::write(dir.join(&info.stored_name), data).await?;
            }
        }

        Ok(())
    }

    /// Folder currently holding the message, if any
    pub async fn locate(&self, id: &str) -> Result<Option<Folder>> {
        for folder in Folder::ALL {
            if fs::metadata(self.message_dir(folder, id)?).await.is_ok() {
                return Ok(Some(folder));
            }
        }
        Ok(None)
    }

    pub async fn load_metadata(&self, folder: Folder, id: &str) -> Result<MessageMetadata> {
        self.read_json(&self.message_dir(folder, id)?.join(METADATA_FILE)).await
    }

    pub async fn load_content(&self, folder: Folder, id: &str) -> Result<MessageContent> {
        self.read_json(&self.message_dir(folder, id)?.join(CONTENT_FILE)).await
    }

    pub async fn load_attachment(
        &self,
        folder: Folder,
        id: &str,
        info: &AttachmentInfo,
    ) -> Result<Vec<u8>> {
        validate_stored_name(&info.stored_name)?;
        let path = self
            .message_dir(folder, id)?
            .join(ATTACHMENTS_DIR)
            .join(&info.stored_name);
        Ok(fs::read(path).await?)
    }

    pub async fn load_receipt(&self, id: &str) -> Result<DeliveryReceipt> {
        self.read_json(&self.message_dir(Folder::Sent, id)?.join(RECEIPT_FILE)).await
    }

    pub async fn load_failure(&self, id: &str) -> Result<FailureRecord> {
        self.read_json(&self.message_dir(Folder::Failed, id)?.join(FAILURE_FILE)).await
    }

    /// Record the delivery and move the message from `incoming` to `sent`
    pub async fn mark_sent(&self, id: &str, receipt: &DeliveryReceipt) -> Result<()> {
        self.transition(id, Folder::Sent, RECEIPT_FILE, receipt).await
    }

    /// Record the final error and move the message from `incoming` to `failed`
    pub async fn mark_failed(&self, id: &str, record: &FailureRecord) -> Result<()> {
        self.transition(id, Folder::Failed, FAILURE_FILE, record).await
    }

    async fn transition<T: Serialize>(
        &self,
        id: &str,
        to: Folder,
        record_file: &str,
        record: &T,
    ) -> Result<()> {
        let source = self.message_dir(Folder::Incoming, id)?;
        let target = self.message_dir(to, id)?;

        if fs::metadata(&source).await.is_err() {
            return Err(RelayError::NotFound(format!("Message {} not in incoming", id)));
        }
        if fs::metadata(&target).await.is_ok() {
            return Err(RelayError::Storage(format!("Message {} already in {}", id, to)));
        }

        // Written before the move so the record travels with the message
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&source.join(record_file), &json).await?;

        fs::rename(&source, &target).await.map_err(|e| {
            RelayError::Storage(format!("Failed to move message {} to {}: {}", id, to, e))
        })?;

        info!("Moved message {} from {} to {}", id, Folder::Incoming, to);
        Ok(())
    }

    /// Message directories in `folder` with their last-modified time
    pub async fn entries(&self, folder: Folder) -> Result<Vec<StoredEntry>> {
        let mut result = Vec::new();
        let mut dir = match fs::read_dir(self.folder_path(folder)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_id(&name).is_err() {
                debug!("Skipping foreign entry {:?} in {}", name, folder);
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            result.push(StoredEntry {
                id: name,
                path: entry.path(),
                modified: metadata.modified()?,
            });
        }

        Ok(result)
    }

    pub async fn count(&self, folder: Folder) -> Result<usize> {
        Ok(self.entries(folder).await?.len())
    }

    /// Metadata of every message in `folder`; unreadable records are skipped
    pub async fn list_metadata(&self, folder: Folder) -> Result<Vec<MessageMetadata>> {
        let mut result = Vec::new();
        for entry in self.entries(folder).await? {
            match self.load_metadata(folder, &entry.id).await {
                Ok(metadata) => result.push(metadata),
                Err(e) => warn!("Skipping message {} in {}: {}", entry.id, folder, e),
            }
        }
        Ok(result)
    }

    pub async fn remove(&self, folder: Folder, id: &str) -> Result<()> {
        let dir = self.message_dir(folder, id)?;
        fs::remove_dir_all(&dir).await?;
        debug!("Removed message {} from {}", id, folder);
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RelayError::NotFound(format!("{:?}", path))
            } else {
                RelayError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await.map_err(|e| {
                RelayError::Storage(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }
}

/// New message id
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// `<index>-<sha256(filename) hex prefix>`; the announced name is kept only
/// in the metadata record
pub fn stored_attachment_name(index: usize, filename: Option<&str>) -> String {
    let digest = Sha256::digest(filename.unwrap_or("attachment").as_bytes());
    let hex = HEXLOWER.encode(&digest);
    format!("{:03}-{}", index, &hex[..16])
}

fn validate_id(id: &str) -> Result<()> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| RelayError::Storage(format!("Invalid message id: {:?}", id)))
}

fn validate_stored_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RelayError::Storage(format!("Invalid attachment name: {:?}", name)))
    }
}
