//! Utility modules
//!
//! - [`email`]: Email address validation and domain extraction (RFC 5321)
//! - [`fs`]: Atomic file writes (temp file + rename)

pub mod email;
pub mod fs;

pub use email::{domain_of, validate_email};
pub use fs::write_atomic;
