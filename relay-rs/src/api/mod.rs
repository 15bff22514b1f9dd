//! Management HTTP API
//!
//! JSON endpoints over the [`RelayManager`](crate::management::RelayManager),
//! protected by the HTTP Basic credentials of an admin account.

pub mod handlers;
pub mod server;

pub use server::ApiServer;
