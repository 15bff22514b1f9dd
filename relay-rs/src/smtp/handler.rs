//! Relay policy behind the SMTP protocol loop
//!
//! [`SmtpSession`](super::SmtpSession) owns the wire protocol and calls a
//! [`SessionHandler`] at each step of a transaction. [`RelayHandler`] is the
//! relay's implementation: it authenticates against the user store, persists
//! accepted messages and queues the ones with external recipients.

use crate::delivery::{DeliveryQueue, DeliveryWorker, LocalDomains};
use crate::error::{RelayError, Result};
use crate::mime::MimeParser;
use crate::storage::{
    generate_id, stored_attachment_name, AttachmentInfo, Envelope, Folder, MessageContent,
    MessageMetadata, MessageStore, NewMessage, SessionInfo,
};
use crate::users::UserStore;
use crate::utils::validate_email;
use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Holds one slot of the connection limit until dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Take a slot unless `max` connections are already live
    pub fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| Self {
                counter: Arc::clone(counter),
            })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Admit a new connection; the guard lives as long as the connection
    async fn on_connect(&self, remote: SocketAddr) -> Result<ConnectionGuard>;

    async fn on_auth(&self, username: &str, password: &str) -> Result<()>;

    async fn on_mail_from(&self, session: &SessionInfo, from: &str) -> Result<()>;

    async fn on_rcpt_to(&self, session: &SessionInfo, to: &str) -> Result<()>;

    /// Accept a complete message and return its id
    async fn on_data(&self, session: &SessionInfo, envelope: &Envelope, data: &[u8])
        -> Result<String>;
}

pub struct RelayHandler {
    users: Arc<UserStore>,
    store: Arc<MessageStore>,
    queue: Arc<DeliveryQueue>,
    worker: Arc<DeliveryWorker>,
    local_domains: LocalDomains,
    connections: Arc<AtomicUsize>,
    max_connections: usize,
}

impl RelayHandler {
    pub fn new(
        users: Arc<UserStore>,
        store: Arc<MessageStore>,
        worker: Arc<DeliveryWorker>,
        local_domains: LocalDomains,
        max_connections: usize,
    ) -> Self {
        Self {
            users,
            store,
            queue: Arc::clone(worker.queue()),
            worker,
            local_domains,
            connections: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Connections currently open
    pub fn live_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn build_message(
        &self,
        session: &SessionInfo,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<NewMessage> {
        let parsed = MimeParser::parse(data)?;
        let id = generate_id();

        let mut attachments = Vec::with_capacity(parsed.attachments.len());
        let mut attachment_data = Vec::with_capacity(parsed.attachments.len());
        for (index, part) in parsed.attachments.into_iter().enumerate() {
            attachments.push(AttachmentInfo {
                stored_name: stored_attachment_name(index, part.filename.as_deref()),
                filename: part.filename,
                content_type: part.content_type,
                size: part.body.len(),
            });
            attachment_data.push(part.body);
        }

        Ok(NewMessage {
            metadata: MessageMetadata {
                id,
                received_at: Utc::now(),
                session: session.clone(),
                envelope: Envelope {
                    from: envelope.from.clone(),
                    to: envelope.to.clone(),
                    cc: parsed.cc,
                    bcc: parsed.bcc,
                },
                subject: parsed.subject,
                message_id: parsed.message_id,
                size: data.len(),
                attachments,
            },
            content: MessageContent {
                headers: parsed.headers,
                text: parsed.text_body,
                html: parsed.html_body,
            },
            attachment_data,
        })
    }
}

#[async_trait]
impl SessionHandler for RelayHandler {
    async fn on_connect(&self, remote: SocketAddr) -> Result<ConnectionGuard> {
        match ConnectionGuard::acquire(&self.connections, self.max_connections) {
            Some(guard) => {
                debug!("Connection from {} ({} live)", remote, self.live_connections());
                Ok(guard)
            }
            None => {
                warn!(
                    "Rejecting {}: {} connections already open",
                    remote, self.max_connections
                );
                Err(RelayError::TooManyConnections)
            }
        }
    }

    async fn on_auth(&self, username: &str, password: &str) -> Result<()> {
        if self.users.authenticate(username, password).await? {
            Ok(())
        } else {
            warn!("SMTP AUTH rejected for {}", username);
            Err(RelayError::AuthenticationFailed)
        }
    }

    async fn on_mail_from(&self, session: &SessionInfo, from: &str) -> Result<()> {
        if !from.is_empty() {
            if let Err(e) = validate_email(from) {
                warn!("MAIL FROM {} from {}: {}", from, session.remote_address, e);
            }
        }
        info!("MAIL FROM: <{}> ({})", from, session.remote_address);
        Ok(())
    }

    async fn on_rcpt_to(&self, session: &SessionInfo, to: &str) -> Result<()> {
        if let Err(e) = validate_email(to) {
            warn!("RCPT TO {} from {}: {}", to, session.remote_address, e);
        }
        info!("RCPT TO: <{}> ({})", to, session.remote_address);
        Ok(())
    }

    async fn on_data(
        &self,
        session: &SessionInfo,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<String> {
        let message = self.build_message(session, envelope, data)?;
        let id = message.metadata.id.clone();

        self.store.save_incoming(&message).await?;

        let external = self.local_domains.external_recipients(&envelope.to);
        let queued = !external.is_empty();
        if queued {
            if let Err(e) = self.queue.enqueue(&id, external).await {
                // Undo the publish
                if let Err(remove_err) = self.store.remove(Folder::Incoming, &id).await {
                    error!("Could not roll back message {}: {}", id, remove_err);
                }
                return Err(e);
            }
        } else {
            info!("Message {} is local only, keeping in incoming", id);
        }

        if let Some(username) = &session.username {
            if let Err(e) = self.users.record_message_sent(username).await {
                warn!("Could not count message {} for {}: {}", id, username, e);
            }
        }

        if queued {
            self.worker.trigger();
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::delivery::Transport;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(&self, _: &str, _: &[String], _: &[u8]) -> Result<()> {
            Err(RelayError::Delivery("unreachable".to_string()))
        }
    }

    async fn handler(max_connections: usize) -> (tempfile::TempDir, RelayHandler) {
        let dir = tempfile::tempdir().unwrap();
        let users = Arc::new(UserStore::open(dir.path().join("users.json")).await.unwrap());
        users.create_account("forms", "pw", false).await.unwrap();
        let store = Arc::new(MessageStore::new(dir.path().join("messages")));
        store.init().await.unwrap();
        let queue = Arc::new(DeliveryQueue::open(dir.path().join("queue")).await.unwrap());
        let config = DeliveryConfig {
            retry_delay_ms: 60_000,
            ..Default::default()
        };
        let worker = Arc::new(DeliveryWorker::new(
            store.clone(),
            queue,
            Arc::new(Unreachable),
            &config,
        ));
        let handler = RelayHandler::new(
            users,
            store,
            worker,
            LocalDomains::new(["localhost"]),
            max_connections,
        );
        (dir, handler)
    }

    fn session() -> SessionInfo {
        SessionInfo {
            username: Some("forms".to_string()),
            remote_address: "127.0.0.1:50000".to_string(),
            hostname: Some("client".to_string()),
        }
    }

    #[test]
    fn test_guard_releases_slot_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionGuard::acquire(&counter, 1).unwrap();
        assert!(ConnectionGuard::acquire(&counter, 1).is_none());
        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 0);
        assert!(ConnectionGuard::acquire(&counter, 1).is_some());
    }

    #[tokio::test]
    async fn test_connection_ceiling() {
        let (_dir, handler) = handler(2).await;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let a = handler.on_connect(addr).await.unwrap();
        let _b = handler.on_connect(addr).await.unwrap();
        assert!(matches!(
            handler.on_connect(addr).await,
            Err(RelayError::TooManyConnections)
        ));

        drop(a);
        assert_eq!(handler.live_connections(), 1);
        assert!(handler.on_connect(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_is_generic_on_failure() {
        let (_dir, handler) = handler(10).await;
        assert!(handler.on_auth("forms", "pw").await.is_ok());
        assert!(matches!(
            handler.on_auth("forms", "bad").await,
            Err(RelayError::AuthenticationFailed)
        ));
        assert!(matches!(
            handler.on_auth("ghost", "pw").await,
            Err(RelayError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_local_message_is_not_queued() {
        let (_dir, handler) = handler(10).await;
        let envelope = Envelope {
            from: "forms@localhost".to_string(),
            to: vec!["ops@localhost".to_string()],
            ..Default::default()
        };

        let id = handler
            .on_data(&session(), &envelope, b"Subject: hi\r\n\r\nhello\r\n")
            .await
            .unwrap();

        assert_eq!(handler.store.locate(&id).await.unwrap(), Some(Folder::Incoming));
        assert!(handler.queue.is_empty().await);
        assert_eq!(handler.users.get("forms").await.unwrap().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_external_recipients_are_queued() {
        let (_dir, handler) = handler(10).await;
        let envelope = Envelope {
            from: "forms@localhost".to_string(),
            to: vec!["ops@localhost".to_string(), "user@external.com".to_string()],
            ..Default::default()
        };
        let data = b"Subject: Report\r\nCc: boss@external.com\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nSee attached\r\n--b\r\nContent-Type: text/csv\r\nContent-Disposition: attachment; filename=\"../report.csv\"\r\n\r\na,b\r\n--b--\r\n";

        let id = handler.on_data(&session(), &envelope, data).await.unwrap();

        let snapshot = handler.queue.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message_id, id);
        assert_eq!(snapshot[0].recipients, vec!["user@external.com"]);

        // Still in incoming: the first failed attempt only reschedules
        let metadata = handler.store.load_metadata(Folder::Incoming, &id).await.unwrap();
        assert_eq!(metadata.envelope.cc, vec!["boss@external.com"]);
        assert_eq!(metadata.attachments.len(), 1);
        assert_eq!(metadata.attachments[0].filename.as_deref(), Some("../report.csv"));
        assert!(!metadata.attachments[0].stored_name.contains('/'));
    }

    #[tokio::test]
    async fn test_failed_enqueue_rolls_back_message() {
        let (_dir, handler) = handler(10).await;
        let envelope = Envelope {
            from: "forms@localhost".to_string(),
            to: vec!["user@external.com".to_string()],
            ..Default::default()
        };
        std::fs::remove_dir_all(handler.queue.dir()).unwrap();

        let result = handler
            .on_data(&session(), &envelope, b"Subject: x\r\n\r\nbody\r\n")
            .await;

        assert!(result.is_err());
        assert_eq!(handler.store.count(Folder::Incoming).await.unwrap(), 0);
        assert!(handler.queue.is_empty().await);
        assert_eq!(handler.users.get("forms").await.unwrap().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_anonymous_message_counts_nobody() {
        let (_dir, handler) = handler(10).await;
        let anonymous = SessionInfo {
            username: None,
            ..session()
        };
        let envelope = Envelope {
            from: String::new(),
            to: vec!["ops@localhost".to_string()],
            ..Default::default()
        };

        handler
            .on_data(&anonymous, &envelope, b"Subject: x\r\n\r\nbody\r\n")
            .await
            .unwrap();

        assert_eq!(handler.users.get("forms").await.unwrap().messages_sent, 0);
    }
}
