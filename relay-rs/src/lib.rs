//! relay-rs: self-hosted SMTP relay
//!
//! Accepts mail from authenticated local senders, keeps a copy of every
//! message on disk and forwards external recipients through an upstream
//! SMTP server with retries.
//!
//! # Features
//!
//! - **SMTP listener**: EHLO/AUTH/MAIL/RCPT/DATA with PLAIN and LOGIN auth,
//!   optional implicit TLS, size and connection limits
//! - **Message store**: one directory per message in `incoming`, `sent` or
//!   `failed`, published with a staging-then-rename step
//! - **Delivery queue**: persistent JSON records, linear backoff, bounded
//!   retries
//! - **Retention**: periodic purge of messages past the storage horizon
//! - **Management API**: HTTP endpoints for stats, messages, accounts and
//!   listener control
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::config::Config;
//! use relay_rs::relay::Relay;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new(Config::load("config.toml")?).await?;
//!     relay.start().await?;
//!     relay.spawn_background().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP protocol implementation
//! - [`storage`]: Message store and retention
//! - [`delivery`]: Queue, routing and upstream transport
//! - [`users`]: Relay accounts
//! - [`management`]: Stats and administration facade
//! - [`api`]: HTTP management API
//! - [`security`]: TLS and SMTP AUTH decoding
//! - [`utils`]: Utility functions (validation, atomic writes)

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod management;
pub mod mime;
pub mod relay;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod users;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use relay::Relay;
