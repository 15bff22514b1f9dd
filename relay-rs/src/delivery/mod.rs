//! Outbound delivery
//!
//! - [`queue`]: durable queue of messages waiting for the upstream relay
//! - [`routing`]: which recipients leave the relay
//! - [`transport`]: the upstream SMTP client
//! - [`worker`]: drain cycle with retry

pub mod queue;
pub mod routing;
pub mod transport;
pub mod types;
pub mod worker;

pub use queue::DeliveryQueue;
pub use routing::LocalDomains;
pub use transport::{Transport, UpstreamTransport};
pub use types::{DrainReport, QueueEntry, QueueStatus};
pub use worker::DeliveryWorker;
