//! SMTP submission listener (RFC 5321)
//!
//! - [`server`]: accepts connections and enforces the connection limit
//! - [`session`]: SMTP session state machine
//! - [`commands`]: SMTP command parsing
//! - [`handler`]: relay policy invoked by the session

pub mod commands;
pub mod handler;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use handler::{ConnectionGuard, RelayHandler, SessionHandler};
pub use server::SmtpServer;
pub use session::{SessionConfig, SmtpSession};
