use std::collections::BTreeMap;

/// An attachment extracted from a message
#[derive(Debug, Clone)]
pub struct MimePart {
    /// `type/subtype`
    pub content_type: String,
    /// Filename from Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// Decoded body
    pub body: Vec<u8>,
}

impl Default for MimePart {
    fn default() -> Self {
        MimePart {
            content_type: "application/octet-stream".to_string(),
            filename: None,
            body: Vec::new(),
        }
    }
}

/// Parsed email with separated parts
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    /// Header name (lowercase) to unfolded value; repeated headers are joined with newlines
    pub headers: BTreeMap<String, String>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Plain text body (if present)
    pub text_body: Option<String>,
    /// HTML body (if present)
    pub html_body: Option<String>,
    /// List of attachments
    pub attachments: Vec<MimePart>,
}

impl ParsedEmail {
    pub fn new() -> Self {
        ParsedEmail::default()
    }

    /// Get total size of all attachments in bytes
    pub fn total_attachment_size(&self) -> usize {
        self.attachments.iter().map(|a| a.body.len()).sum()
    }

    /// Get number of attachments
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Check if email has attachments
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
