//! MIME message parsing and reconstruction
//!
//! Parsing is delegated to `mail-parser`, reconstruction of outbound
//! messages to `mail-builder`.

pub mod builder;
pub mod parser;
pub mod types;

pub use builder::compose;
pub use parser::MimeParser;
pub use types::{MimePart, ParsedEmail};
