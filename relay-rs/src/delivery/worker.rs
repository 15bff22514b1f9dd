//! Delivery worker
//!
//! Drains ready queue entries through the [`Transport`]. A successful send
//! moves the message to `sent` before its queue record is deleted; after
//! `max_retries` failed attempts the message moves to `failed`. Retries back
//! off linearly: attempt `n` waits `retry_delay * n`.

use crate::config::DeliveryConfig;
use crate::delivery::queue::DeliveryQueue;
use crate::delivery::transport::Transport;
use crate::delivery::types::{DrainReport, QueueEntry};
use crate::error::{RelayError, Result};
use crate::mime::compose;
use crate::storage::{DeliveryReceipt, FailureRecord, Folder, MessageStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum Outcome {
    Delivered,
    Retried,
    Failed,
    Skipped,
}

pub struct DeliveryWorker {
    store: Arc<MessageStore>,
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn Transport>,
    max_retries: u32,
    retry_delay: Duration,
    send_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<MessageStore>,
        queue: Arc<DeliveryQueue>,
        transport: Arc<dyn Transport>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            transport,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            send_timeout: config.send_timeout(),
        }
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Start a drain in the background
    pub fn trigger(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.drain().await;
        });
    }

    /// Drain every `every` until `cancel` fires
    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        info!("Starting delivery worker (every {:?})", every);

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Delivery worker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }
    }

    /// One pass over the entries that are ready now
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        let claimed = self.queue.claim_ready(Utc::now()).await;
        if claimed.is_empty() {
            return report;
        }
        debug!("Draining {} queue entry(ies)", claimed.len());

        for entry in claimed {
            let queue_id = entry.queue_id.clone();
            match self.process(entry).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Skipped) => {}
                Err(e) => {
                    error!("Queue entry {}: {}", queue_id, e);
                    self.queue.release(&queue_id).await;
                }
            }
        }

        info!(
            "Delivery drain: {} delivered, {} retried, {} failed",
            report.delivered, report.retried, report.failed
        );
        report
    }

    async fn process(&self, mut entry: QueueEntry) -> Result<Outcome> {
        match self.store.locate(&entry.message_id).await? {
            Some(Folder::Incoming) => {}
            Some(folder) => {
                // Moved by an earlier run that stopped before deleting the record
                info!(
                    "Message {} already in {}, completing queue entry {}",
                    entry.message_id, folder, entry.queue_id
                );
                self.queue.complete(&entry.queue_id).await?;
                return Ok(Outcome::Skipped);
            }
            None => {
                warn!(
                    "Message {} no longer stored, dropping queue entry {}",
                    entry.message_id, entry.queue_id
                );
                self.queue.complete(&entry.queue_id).await?;
                return Ok(Outcome::Skipped);
            }
        }

        match self.attempt(&entry).await {
            Ok(()) => {
                let receipt = DeliveryReceipt {
                    delivered_at: Utc::now(),
                    recipients: entry.recipients.clone(),
                    attempts: entry.attempts + 1,
                };
                info!(
                    "Delivered message {} to {} (attempt {})",
                    entry.message_id,
                    entry.recipients.join(", "),
                    receipt.attempts
                );

                if let Err(e) = self.store.mark_sent(&entry.message_id, &receipt).await {
                    error!("Message {} delivered but not moved to sent: {}", entry.message_id, e);
                }
                self.queue.complete(&entry.queue_id).await?;
                Ok(Outcome::Delivered)
            }
            Err(e) => {
                entry.attempts += 1;
                entry.last_error = Some(e.to_string());

                if entry.attempts < self.max_retries {
                    let delay = self.retry_delay * entry.attempts;
                    entry.next_retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        "Delivery of {} failed (attempt {}/{}): {}; retrying in {:?}",
                        entry.message_id, entry.attempts, self.max_retries, e, delay
                    );
                    self.queue.reschedule(entry).await?;
                    return Ok(Outcome::Retried);
                }

                error!(
                    "Delivery of {} failed permanently after {} attempt(s): {}",
                    entry.message_id, entry.attempts, e
                );
                let record = FailureRecord {
                    failed_at: Utc::now(),
                    recipients: entry.recipients.clone(),
                    attempts: entry.attempts,
                    last_error: e.to_string(),
                };
                if let Err(e) = self.store.mark_failed(&entry.message_id, &record).await {
                    error!("Message {} not moved to failed: {}", entry.message_id, e);
                }
                self.queue.complete(&entry.queue_id).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn attempt(&self, entry: &QueueEntry) -> Result<()> {
        let id = &entry.message_id;
        let metadata = self.store.load_metadata(Folder::Incoming, id).await?;
        let content = self.store.load_content(Folder::Incoming, id).await?;

        let mut attachments = Vec::with_capacity(metadata.attachments.len());
        for info in &metadata.attachments {
            let data = self.store.load_attachment(Folder::Incoming, id, info).await?;
            attachments.push((info.clone(), data));
        }

        let message = compose(&metadata, &content, &attachments)?;

        timeout(
            self.send_timeout,
            self.transport
                .send(&metadata.envelope.from, &entry.recipients, &message),
        )
        .await
        .map_err(|_| RelayError::Timeout(format!("upstream send after {:?}", self.send_timeout)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::MockTransport;
    use crate::delivery::types::QueueStatus;
    use crate::storage::{
        generate_id, Envelope, MessageContent, MessageMetadata, NewMessage, SessionInfo,
    };
    use async_trait::async_trait;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MessageStore>,
        queue: Arc<DeliveryQueue>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().join("messages")));
        store.init().await.unwrap();
        let queue = Arc::new(DeliveryQueue::open(dir.path().join("queue")).await.unwrap());
        Fixture { _dir: dir, store, queue }
    }

    fn config(max_retries: u32, retry_delay_ms: u64) -> DeliveryConfig {
        DeliveryConfig {
            max_retries,
            retry_delay_ms,
            send_timeout_secs: 5,
            ..Default::default()
        }
    }

    async fn queued_message(f: &Fixture) -> (String, QueueEntry) {
        let id = generate_id();
        let message = NewMessage {
            metadata: MessageMetadata {
                id: id.clone(),
                received_at: Utc::now(),
                session: SessionInfo::default(),
                envelope: Envelope {
                    from: "forms@localhost".to_string(),
                    to: vec!["user@external.com".to_string()],
                    ..Default::default()
                },
                subject: Some("Your code".to_string()),
                message_id: None,
                size: 32,
                attachments: Vec::new(),
            },
            content: MessageContent {
                text: Some("123456".to_string()),
                ..Default::default()
            },
            attachment_data: Vec::new(),
        };
        f.store.save_incoming(&message).await.unwrap();
        let entry = f
            .queue
            .enqueue(&id, vec!["user@external.com".to_string()])
            .await
            .unwrap();
        (id, entry)
    }

    fn worker(f: &Fixture, transport: impl Transport + 'static, config: DeliveryConfig) -> DeliveryWorker {
        DeliveryWorker::new(f.store.clone(), f.queue.clone(), Arc::new(transport), &config)
    }

    fn queue_files(f: &Fixture) -> usize {
        std::fs::read_dir(f.queue.dir()).unwrap().count()
    }

    #[tokio::test]
    async fn test_successful_delivery_moves_to_sent() {
        let f = fixture().await;
        let (id, _) = queued_message(&f).await;

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|from, recipients, message| {
                from == "forms@localhost"
                    && recipients.to_vec() == vec!["user@external.com".to_string()]
                    && String::from_utf8_lossy(message).contains("Your code")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let report = worker(&f, transport, config(3, 0)).drain().await;

        assert_eq!(report.delivered, 1);
        assert_eq!(f.store.locate(&id).await.unwrap(), Some(Folder::Sent));
        assert_eq!(f.store.load_receipt(&id).await.unwrap().attempts, 1);
        assert!(f.queue.is_empty().await);
        assert_eq!(queue_files(&f), 0);
    }

    #[tokio::test]
    async fn test_three_failures_produce_one_failure_record() {
        let f = fixture().await;
        let (id, _) = queued_message(&f).await;

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _, _| Err(RelayError::Delivery("connection refused".to_string())));

        let worker = worker(&f, transport, config(3, 0));
        let first = worker.drain().await;
        let second = worker.drain().await;
        let third = worker.drain().await;
        let fourth = worker.drain().await;

        assert_eq!(first.retried, 1);
        assert_eq!(second.retried, 1);
        assert_eq!(third.failed, 1);
        assert_eq!(fourth.processed(), 0);

        assert_eq!(f.store.locate(&id).await.unwrap(), Some(Folder::Failed));
        assert_eq!(f.store.count(Folder::Failed).await.unwrap(), 1);
        let record = f.store.load_failure(&id).await.unwrap();
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.contains("connection refused"));
        assert_eq!(queue_files(&f), 0);
    }

    #[tokio::test]
    async fn test_retry_backs_off_linearly() {
        let f = fixture().await;
        let (_, entry) = queued_message(&f).await;

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _, _| Err(RelayError::Delivery("busy".to_string())));

        let before = Utc::now();
        let worker = worker(&f, transport, config(3, 5000));
        assert_eq!(worker.drain().await.retried, 1);

        // Not ready again until the delay has elapsed
        assert_eq!(worker.drain().await.processed(), 0);

        let stored = f.queue.get(&entry.queue_id).await.unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.attempts <= 3);
        assert_eq!(stored.last_error.as_deref(), Some("Delivery failed: busy"));
        assert!(stored.next_retry_at >= before + chrono::Duration::milliseconds(5000));
        assert!(stored.next_retry_at <= Utc::now() + chrono::Duration::milliseconds(5000));
    }

    #[tokio::test]
    async fn test_already_sent_message_is_not_resent() {
        let f = fixture().await;
        let (id, _) = queued_message(&f).await;

        let receipt = DeliveryReceipt {
            delivered_at: Utc::now(),
            recipients: vec!["user@external.com".to_string()],
            attempts: 1,
        };
        f.store.mark_sent(&id, &receipt).await.unwrap();

        let mut transport = MockTransport::new();
        transport.expect_send().never();

        worker(&f, transport, config(3, 0)).drain().await;

        assert!(f.queue.is_empty().await);
        assert_eq!(queue_files(&f), 0);
    }

    #[tokio::test]
    async fn test_unwritable_queue_does_not_strand_entry() {
        let f = fixture().await;
        let (id, entry) = queued_message(&f).await;

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _, _| Err(RelayError::Delivery("connection refused".to_string())));
        let worker = worker(&f, transport, config(3, 0));

        // First attempt cannot write the rescheduled record
        std::fs::remove_dir_all(f.queue.dir()).unwrap();
        worker.drain().await;
        let stored = f.queue.get(&entry.queue_id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Queued);
        assert_eq!(stored.attempts, 1);

        std::fs::create_dir_all(f.queue.dir()).unwrap();
        assert_eq!(worker.drain().await.retried, 1);
        assert_eq!(worker.drain().await.failed, 1);

        assert_eq!(f.store.locate(&id).await.unwrap(), Some(Folder::Failed));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_processing_error_releases_claim() {
        let f = fixture().await;
        // Not a valid message id, so looking the message up fails
        let entry = f
            .queue
            .enqueue("../escape", vec!["user@external.com".to_string()])
            .await
            .unwrap();

        let mut transport = MockTransport::new();
        transport.expect_send().never();
        let worker = worker(&f, transport, config(3, 0));

        assert_eq!(worker.drain().await.processed(), 0);

        let stored = f.queue.get(&entry.queue_id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Queued);
        assert_eq!(f.queue.claim_ready(Utc::now()).await.len(), 1);
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _from: &str, _recipients: &[String], _message: &[u8]) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_timeout_counts_as_failure() {
        let f = fixture().await;
        let (_, entry) = queued_message(&f).await;
        let config = DeliveryConfig {
            send_timeout_secs: 1,
            ..config(3, 0)
        };

        let report = worker(&f, StalledTransport, config).drain().await;

        assert_eq!(report.retried, 1);
        let stored = f.queue.get(&entry.queue_id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("Timed out"));
    }
}
