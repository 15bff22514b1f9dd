//! Relay runtime
//!
//! Owns every component, starts and stops the SMTP listener and runs the
//! delivery worker and retention sweeper under one cancellation token.

use crate::config::Config;
use crate::delivery::{DeliveryQueue, DeliveryWorker, LocalDomains, Transport, UpstreamTransport};
use crate::error::{RelayError, Result};
use crate::security::TlsConfig;
use crate::smtp::{RelayHandler, SessionConfig, SmtpServer};
use crate::storage::{MessageStore, RetentionSweeper};
use crate::users::UserStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct RunningListener {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

pub struct Relay {
    config: Config,
    users: Arc<UserStore>,
    store: Arc<MessageStore>,
    queue: Arc<DeliveryQueue>,
    worker: Arc<DeliveryWorker>,
    handler: Arc<RelayHandler>,
    tls: Option<TlsConfig>,
    listener: Mutex<Option<RunningListener>>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    created_at: Instant,
}

impl Relay {
    /// Build a relay delivering through the configured upstream
    pub async fn new(config: Config) -> Result<Self> {
        let transport = UpstreamTransport::new(&config.upstream, config.delivery.send_timeout())?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let users = Arc::new(UserStore::open(config.storage.users_file()).await?);
        users
            .bootstrap_admin(&config.server.admin_username, &config.server.admin_password)
            .await?;

        let store = Arc::new(MessageStore::new(config.storage.messages_dir()));
        store.init().await?;

        let queue = Arc::new(DeliveryQueue::open(config.storage.queue_dir()).await?);
        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            transport,
            &config.delivery,
        ));

        let handler = Arc::new(RelayHandler::new(
            Arc::clone(&users),
            Arc::clone(&store),
            Arc::clone(&worker),
            LocalDomains::new(config.local_domains()),
            config.smtp.max_connections,
        ));

        let tls = if config.smtp.secure {
            match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
                (Some(cert), Some(key)) => Some(TlsConfig::from_pem_files(cert, key)?),
                _ => {
                    return Err(RelayError::Config(
                        "smtp.secure requires tls_cert_path and tls_key_path".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            users,
            store,
            queue,
            worker,
            handler,
            tls,
            listener: Mutex::new(None),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            created_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn worker(&self) -> &Arc<DeliveryWorker> {
        &self.worker
    }

    pub fn live_connections(&self) -> usize {
        self.handler.live_connections()
    }

    /// Start accepting SMTP connections; a running listener is left as is
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(running) = listener.as_ref() {
            if !running.handle.is_finished() {
                return Ok(running.addr);
            }
        }

        let server = SmtpServer::bind(
            &self.config.smtp.listen_addr,
            SessionConfig::from_config(&self.config),
            self.handler.clone(),
            self.tls.clone(),
        )
        .await?;
        let addr = server.local_addr()?;

        let cancel = self.background.child_token();
        let handle = tokio::spawn(server.run(cancel.clone()));

        *listener = Some(RunningListener {
            addr,
            cancel,
            handle,
        });

        info!("Relay started on {}", addr);
        Ok(addr)
    }

    /// Stop accepting connections; open sessions run to completion
    pub async fn stop(&self) -> Result<()> {
        let running = self.listener.lock().await.take();
        let Some(running) = running else {
            return Ok(());
        };

        running.cancel.cancel();
        match running.handle.await {
            Ok(result) => result?,
            Err(e) => error!("SMTP listener task failed: {}", e),
        }

        info!("Relay stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|running| running.addr)
    }

    /// Time since the relay was built, independent of the listener
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Spawn the periodic delivery drain and the retention sweeper
    pub async fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().await;

        // Deliver whatever survived the last run
        self.worker.trigger();

        tasks.push(tokio::spawn(Arc::clone(&self.worker).run(
            self.config.delivery.drain_interval(),
            self.background.child_token(),
        )));

        let sweeper = RetentionSweeper::new(
            Arc::clone(&self.store),
            self.config.storage.max_storage_age(),
        );
        tasks.push(tokio::spawn(sweeper.run(
            self.config.storage.cleanup_interval(),
            self.background.child_token(),
        )));
    }

    /// Stop the listener and every background task
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.background.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        info!("Relay shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Accepting;

    #[async_trait]
    impl Transport for Accepting {
        async fn send(&self, _: &str, _: &[String], _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.smtp.listen_addr = "127.0.0.1:0".to_string();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::with_transport(test_config(&dir), Arc::new(Accepting))
            .await
            .unwrap();
        assert!(!relay.is_running().await);

        let addr = relay.start().await.unwrap();
        assert!(relay.is_running().await);
        assert_eq!(relay.listen_addr().await, Some(addr));
        // Starting twice keeps the same listener
        assert_eq!(relay.start().await.unwrap(), addr);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let running_uptime = relay.uptime();

        relay.stop().await.unwrap();
        assert!(!relay.is_running().await);
        // Process uptime keeps counting across listener restarts
        assert!(relay.uptime() >= running_uptime);
        assert!(relay.uptime() >= Duration::from_millis(20));
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_uptime_counts_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::with_transport(test_config(&dir), Arc::new(Accepting))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_running().await);
        assert!(relay.uptime() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_bootstraps_admin_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::with_transport(test_config(&dir), Arc::new(Accepting))
            .await
            .unwrap();

        assert!(relay.users().authenticate_admin("admin", "changeme").await.unwrap());
        assert!(dir.path().join("messages/incoming").is_dir());
        assert!(dir.path().join("queue").is_dir());
    }

    #[tokio::test]
    async fn test_shutdown_stops_background() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::with_transport(test_config(&dir), Arc::new(Accepting))
            .await
            .unwrap();
        relay.start().await.unwrap();
        relay.spawn_background().await;

        tokio::time::timeout(Duration::from_secs(5), relay.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert!(!relay.is_running().await);
    }

    #[tokio::test]
    async fn test_secure_without_certificates_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.smtp.secure = true;
        assert!(Relay::with_transport(config, Arc::new(Accepting)).await.is_err());
    }
}
