//! Durable delivery queue
//!
//! The live index is an insertion-ordered list kept in memory; each entry is
//! mirrored to `<queue dir>/<queueId>.json`. A record is on disk before the
//! entry becomes visible in the index and is deleted once the entry reaches
//! a terminal state.

use crate::delivery::types::{QueueEntry, QueueStatus};
use crate::error::{RelayError, Result};
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct DeliveryQueue {
    dir: PathBuf,
    entries: Mutex<Vec<QueueEntry>>,
}

impl DeliveryQueue {
    /// Load every queue record found in `dir`
    ///
    /// Entries left in `processing` by an interrupted run go back to `queued`.
    pub async fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            RelayError::Storage(format!("Failed to create queue directory {:?}: {}", dir, e))
        })?;

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let mut entry = match read_record(&path).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable queue record {:?}: {}", path, e);
                    continue;
                }
            };

            match entry.status {
                QueueStatus::Queued => {}
                QueueStatus::Processing => {
                    info!("Resetting interrupted queue entry {}", entry.queue_id);
                    entry.status = QueueStatus::Queued;
                    write_atomic(&path, &serde_json::to_vec_pretty(&entry)?).await?;
                }
                QueueStatus::Delivered | QueueStatus::Failed => {
                    debug!("Removing terminal queue record {:?}", path);
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
            }

            entries.push(entry);
        }

        entries.sort_by_key(|e| e.enqueued_at);
        info!("Loaded {} queued delivery(ies) from {:?}", entries.len(), dir);

        Ok(Self {
            dir,
            entries: Mutex::new(entries),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn enqueue(&self, message_id: &str, recipients: Vec<String>) -> Result<QueueEntry> {
        let entry = QueueEntry::new(message_id, recipients);

        let mut entries = self.entries.lock().await;
        self.persist(&entry).await?;
        entries.push(entry.clone());

        info!(
            "Queued message {} for {} recipient(s) as {}",
            entry.message_id,
            entry.recipients.len(),
            entry.queue_id
        );
        Ok(entry)
    }

    /// Flip every ready entry to `processing` and hand it out
    ///
    /// An entry already in `processing` is never returned twice.
    pub async fn claim_ready(&self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock().await;
        entries
            .iter_mut()
            .filter(|e| e.is_ready(now))
            .map(|e| {
                e.status = QueueStatus::Processing;
                e.clone()
            })
            .collect()
    }

    /// Persist an updated entry and return it to `queued`
    ///
    /// The live entry is updated even when the record cannot be written, so
    /// attempts keep counting towards the retry limit.
    pub async fn reschedule(&self, mut entry: QueueEntry) -> Result<()> {
        entry.status = QueueStatus::Queued;

        let mut entries = self.entries.lock().await;
        let slot = entries
            .iter_mut()
            .find(|e| e.queue_id == entry.queue_id)
            .ok_or_else(|| RelayError::NotFound(format!("Queue entry {}", entry.queue_id)))?;

        let persisted = self.persist(&entry).await;
        *slot = entry;
        persisted
    }

    /// Give up a claim without changing the entry
    pub async fn release(&self, queue_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.queue_id == queue_id) {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Queued;
            }
        }
    }

    /// Terminal transition: drop from the index and delete the record
    pub async fn complete(&self, queue_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.queue_id != queue_id);

        match fs::remove_file(self.record_path(queue_id)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Queue entry {} completed", queue_id);
        Ok(())
    }

    pub async fn get(&self, queue_id: &str) -> Option<QueueEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.queue_id == queue_id)
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn record_path(&self, queue_id: &str) -> Result<PathBuf> {
        Uuid::parse_str(queue_id)
            .map_err(|_| RelayError::Storage(format!("Invalid queue id: {:?}", queue_id)))?;
        Ok(self.dir.join(format!("{}.json", queue_id)))
    }

    async fn persist(&self, entry: &QueueEntry) -> Result<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.record_path(&entry.queue_id)?, &json).await
    }
}

async fn read_record(path: &Path) -> Result<QueueEntry> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn open_queue() -> (tempfile::TempDir, DeliveryQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeliveryQueue::open(dir.path().join("queue")).await.unwrap();
        (dir, queue)
    }

    fn record_count(queue: &DeliveryQueue) -> usize {
        std::fs::read_dir(queue.dir()).unwrap().count()
    }

    #[tokio::test]
    async fn test_enqueue_writes_record() {
        let (_dir, queue) = open_queue().await;

        let entry = queue
            .enqueue("m1", vec!["user@external.com".to_string()])
            .await
            .unwrap();

        assert_eq!(queue.len().await, 1);
        assert_eq!(record_count(&queue), 1);
        let raw = std::fs::read(queue.dir().join(format!("{}.json", entry.queue_id))).unwrap();
        let stored: QueueEntry = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored, entry);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();

        let first = queue.claim_ready(Utc::now()).await;
        let second = queue.claim_ready(Utc::now()).await;

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(first[0].status, QueueStatus::Processing);
    }

    #[tokio::test]
    async fn test_reschedule_delays_claim() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();

        let mut entry = queue.claim_ready(Utc::now()).await.remove(0);
        entry.attempts = 1;
        entry.next_retry_at = Utc::now() + Duration::seconds(60);
        queue.reschedule(entry.clone()).await.unwrap();

        assert!(queue.claim_ready(Utc::now()).await.is_empty());
        let later = queue.claim_ready(Utc::now() + Duration::seconds(61)).await;
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_release_makes_entry_claimable() {
        let (_dir, queue) = open_queue().await;
        let entry = queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();

        assert_eq!(queue.claim_ready(Utc::now()).await.len(), 1);
        queue.release(&entry.queue_id).await;

        let again = queue.claim_ready(Utc::now()).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_reschedule_updates_entry_when_write_fails() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();
        let mut entry = queue.claim_ready(Utc::now()).await.remove(0);

        std::fs::remove_dir_all(queue.dir()).unwrap();
        entry.attempts = 1;
        assert!(queue.reschedule(entry.clone()).await.is_err());

        let stored = queue.get(&entry.queue_id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Queued);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_complete_removes_record() {
        let (_dir, queue) = open_queue().await;
        let entry = queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();

        queue.complete(&entry.queue_id).await.unwrap();

        assert!(queue.is_empty().await);
        assert!(queue.get(&entry.queue_id).await.is_none());
        assert_eq!(record_count(&queue), 0);
    }

    #[tokio::test]
    async fn test_reopen_restores_order_and_resets_processing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");

        let (first, second) = {
            let queue = DeliveryQueue::open(&path).await.unwrap();
            let first = queue.enqueue("m1", vec!["a@x.com".to_string()]).await.unwrap();
            let second = queue.enqueue("m2", vec!["b@x.com".to_string()]).await.unwrap();
            (first, second)
        };

        // Simulate a crash while the first entry was in flight
        let mut interrupted = first.clone();
        interrupted.status = QueueStatus::Processing;
        std::fs::write(
            path.join(format!("{}.json", first.queue_id)),
            serde_json::to_vec(&interrupted).unwrap(),
        )
        .unwrap();
        std::fs::write(path.join("garbage.json"), b"{").unwrap();

        let queue = DeliveryQueue::open(&path).await.unwrap();
        let snapshot = queue.snapshot().await;

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].queue_id, first.queue_id);
        assert_eq!(snapshot[1].queue_id, second.queue_id);
        assert!(snapshot.iter().all(|e| e.status == QueueStatus::Queued));
    }
}
