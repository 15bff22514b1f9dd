//! Security module
//!
//! - [`auth`]: SMTP AUTH mechanisms (LOGIN, PLAIN)
//! - [`tls`]: implicit TLS on the submission listener

pub mod auth;
pub mod tls;

pub use auth::AuthMechanism;
pub use tls::TlsConfig;
