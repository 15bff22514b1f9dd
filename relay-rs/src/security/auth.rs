//! SMTP AUTH decoding
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)
//!
//! Credentials are verified against the [`UserStore`](crate::users::UserStore).

use crate::error::{RelayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Mechanisms advertised in the EHLO response
    pub const ADVERTISED: &'static str = "PLAIN LOGIN";

    /// Parse mechanism from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Decode PLAIN authentication data
///
/// Format: `authzid\0username\0password` (base64 encoded)
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| RelayError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    let parts: Vec<&str> = std::str::from_utf8(&decoded)
        .map_err(|e| RelayError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?
        .split('\0')
        .collect();

    if parts.len() != 3 {
        return Err(RelayError::SmtpProtocol(
            "Invalid PLAIN auth format".to_string(),
        ));
    }

    // parts[0] is the authorization identity (often empty)
    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one LOGIN step; username and password are sent separately
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| RelayError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| RelayError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_auth() {
        // \0username\0password encoded in base64
        let auth_data = BASE64.encode(b"\0forms\0password123");

        let (username, password) = decode_plain_auth(&auth_data).unwrap();
        assert_eq!(username, "forms");
        assert_eq!(password, "password123");
    }

    #[test]
    fn test_decode_plain_auth_rejects_malformed() {
        assert!(decode_plain_auth("not base64!").is_err());
        assert!(decode_plain_auth(&BASE64.encode(b"forms:password")).is_err());
    }

    #[test]
    fn test_decode_login_credential() {
        let encoded = BASE64.encode(b"forms");
        assert_eq!(decode_login_credential(&encoded).unwrap(), "forms");
    }

    #[test]
    fn test_auth_mechanism_parse() {
        assert_eq!(AuthMechanism::parse("PLAIN"), Some(AuthMechanism::Plain));
        assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
        assert_eq!(AuthMechanism::parse("LOGIN"), Some(AuthMechanism::Login));
        assert_eq!(AuthMechanism::parse("CRAM-MD5"), None);
    }
}
