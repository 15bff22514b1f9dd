//! Management facade over a running [`Relay`]
//!
//! Everything the HTTP API and external tooling can do goes through
//! [`RelayManager`].

use crate::error::Result;
use crate::management::types::{FolderCounts, RelayStats};
use crate::relay::Relay;
use crate::storage::{Folder, MessageListing};
use crate::users::AccountSummary;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct RelayManager {
    relay: Arc<Relay>,
}

impl RelayManager {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        let store = self.relay.store();

        Ok(RelayStats {
            running: self.relay.is_running().await,
            listen_address: self.relay.listen_addr().await.map(|a| a.to_string()),
            active_connections: self.relay.live_connections(),
            queue_size: self.relay.queue().len().await,
            account_count: self.relay.users().count().await,
            uptime_secs: self.relay.uptime().as_secs(),
            folders: FolderCounts {
                incoming: store.count(Folder::Incoming).await?,
                sent: store.count(Folder::Sent).await?,
                failed: store.count(Folder::Failed).await?,
            },
        })
    }

    /// Newest messages across every folder, newest first
    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageListing>> {
        let store = self.relay.store();

        let mut listings = Vec::new();
        for folder in Folder::ALL {
            listings.extend(
                store
                    .list_metadata(folder)
                    .await?
                    .into_iter()
                    .map(|metadata| MessageListing { folder, metadata }),
            );
        }

        listings.sort_by(|a, b| b.metadata.received_at.cmp(&a.metadata.received_at));
        listings.truncate(limit);
        Ok(listings)
    }

    pub async fn list_accounts(&self) -> Vec<AccountSummary> {
        self.relay.users().list().await
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<AccountSummary> {
        self.relay.users().create_account(username, password, is_admin).await
    }

    pub async fn deactivate_account(&self, username: &str) -> Result<()> {
        self.relay.users().deactivate(username).await
    }

    pub async fn reset_password(&self, username: &str, password: &str) -> Result<()> {
        self.relay.users().reset_password(username, password).await
    }

    pub async fn authenticate_admin(&self, username: &str, password: &str) -> Result<bool> {
        self.relay.users().authenticate_admin(username, password).await
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        info!("Relay start requested");
        self.relay.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Relay stop requested");
        self.relay.stop().await
    }
}
