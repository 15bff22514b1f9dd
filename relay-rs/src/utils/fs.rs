//! Crash-safe file writes
//!
//! Readers either see the previous file or the complete new one: content is
//! written to a sibling temp file, flushed, then renamed over the target.

use crate::error::{RelayError, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RelayError::Storage(format!("No parent directory for {:?}", path)))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| RelayError::Storage(format!("No file name in {:?}", path)))?
        .to_string_lossy();

    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let mut file = fs::File::create(&tmp_path).await?;
    if let Err(e) = async {
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await
    {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    Ok(())
}
