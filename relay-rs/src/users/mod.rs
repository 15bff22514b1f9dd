//! Relay user accounts
//!
//! Accounts authenticate SMTP senders and management API callers. They are
//! kept in a single JSON document rewritten on every mutation.

pub mod store;
pub mod types;

pub use store::UserStore;
pub use types::{Account, AccountSummary};
