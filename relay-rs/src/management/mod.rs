//! Management facade: statistics, message listings, account administration
//! and listener control

pub mod manager;
pub mod types;

pub use manager::RelayManager;
pub use types::{FolderCounts, RelayStats};
