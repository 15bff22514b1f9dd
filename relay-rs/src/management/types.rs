use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCounts {
    pub incoming: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Snapshot of the relay for dashboards and the admin CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub running: bool,
    pub listen_address: Option<String>,
    pub active_connections: usize,
    pub queue_size: usize,
    pub account_count: usize,
    pub uptime_secs: u64,
    pub folders: FolderCounts,
}
