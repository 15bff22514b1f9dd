use crate::error::{RelayError, Result};
use mail_parser::{Address, MessageParser, MimeHeaders, PartType};
use std::collections::BTreeMap;

use super::types::{MimePart, ParsedEmail};

/// MIME message parser
pub struct MimeParser;

impl MimeParser {
    /// Parse a raw email message into structured parts
    pub fn parse(message: &[u8]) -> Result<ParsedEmail> {
        let parsed = MessageParser::default()
            .parse(message)
            .ok_or_else(|| RelayError::Parse("Message could not be parsed".to_string()))?;

        let raw = String::from_utf8_lossy(message);
        let headers = Self::parse_headers(Self::header_section(&raw));

        // mail-parser synthesizes a text body from HTML (and vice versa);
        // only keep parts that really are of that type.
        let text_body = parsed.text_part(0).and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        });
        let html_body = parsed.html_part(0).and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });

        let attachments = parsed
            .attachments()
            .map(|part| MimePart {
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| MimePart::default().content_type),
                filename: part.attachment_name().map(str::to_string),
                body: part.contents().to_vec(),
            })
            .collect();

        Ok(ParsedEmail {
            headers,
            subject: parsed.subject().map(str::to_string),
            message_id: parsed.message_id().map(str::to_string),
            cc: parsed.cc().map(Self::addresses).unwrap_or_default(),
            bcc: parsed.bcc().map(Self::addresses).unwrap_or_default(),
            text_body,
            html_body,
            attachments,
        })
    }

    fn addresses(address: &Address<'_>) -> Vec<String> {
        match address {
            Address::List(list) => list
                .iter()
                .filter_map(|addr| addr.address.as_deref().map(str::to_string))
                .collect(),
            Address::Group(groups) => groups
                .iter()
                .flat_map(|group| group.addresses.iter())
                .filter_map(|addr| addr.address.as_deref().map(str::to_string))
                .collect(),
        }
    }

    /// Header block of the message (everything before the first blank line)
    fn header_section(message: &str) -> &str {
        // Headers end with double CRLF or double LF
        if let Some(pos) = message.find("\r\n\r\n") {
            &message[..pos]
        } else if let Some(pos) = message.find("\n\n") {
            &message[..pos]
        } else {
            message
        }
    }

    /// Parse email headers into a map of lowercase names to unfolded values
    fn parse_headers(headers_str: &str) -> BTreeMap<String, String> {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut current_header: Option<(String, String)> = None;

        let save = |headers: &mut BTreeMap<String, String>, (name, value): (String, String)| {
            headers
                .entry(name.to_lowercase())
                .and_modify(|existing| {
                    existing.push('\n');
                    existing.push_str(&value);
                })
                .or_insert(value);
        };

        for line in headers_str.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of previous header (folded header)
                if let Some((_, ref mut value)) = current_header {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some(colon_pos) = line.find(':') {
                // Save previous header if exists
                if let Some(header) = current_header.take() {
                    save(&mut headers, header);
                }

                // Start new header
                let name = line[..colon_pos].trim().to_string();
                let value = line[colon_pos + 1..].trim().to_string();
                current_header = Some((name, value));
            }
        }

        // Save last header
        if let Some(header) = current_header {
            save(&mut headers, header);
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers_str = "From: test@example.com\nSubject: Test Email\nContent-Type: text/plain";
        let headers = MimeParser::parse_headers(headers_str);

        assert_eq!(headers.get("from"), Some(&"test@example.com".to_string()));
        assert_eq!(headers.get("subject"), Some(&"Test Email".to_string()));
        assert_eq!(headers.get("content-type"), Some(&"text/plain".to_string()));
    }

    #[test]
    fn test_parse_headers_folded() {
        let headers_str = "Subject: This is a very long subject\n that spans multiple lines";
        let headers = MimeParser::parse_headers(headers_str);

        assert_eq!(
            headers.get("subject"),
            Some(&"This is a very long subject that spans multiple lines".to_string())
        );
    }

    #[test]
    fn test_parse_headers_repeated() {
        let headers_str = "Received: from a\r\nReceived: from b\r\nTo: x@example.com";
        let headers = MimeParser::parse_headers(headers_str);

        assert_eq!(headers.get("received"), Some(&"from a\nfrom b".to_string()));
    }

    #[test]
    fn test_parse_simple_text_email() {
        let message = b"From: sender@example.com\r\nTo: recipient@example.com\r\nSubject: Test\r\nMessage-ID: <abc@example.com>\r\n\r\nHello World\r\n";
        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.headers.get("from"), Some(&"sender@example.com".to_string()));
        assert_eq!(parsed.subject.as_deref(), Some("Test"));
        assert_eq!(parsed.message_id.as_deref(), Some("abc@example.com"));
        assert_eq!(parsed.text_body.as_deref().map(str::trim), Some("Hello World"));
        assert!(parsed.html_body.is_none());
        assert_eq!(parsed.attachment_count(), 0);
    }

    #[test]
    fn test_parse_multipart_alternative() {
        let message = b"Subject: OTP\r\nContent-Type: multipart/alternative; boundary=\"b1\"\r\n\r\n--b1\r\nContent-Type: text/plain\r\n\r\nYour code is 123456\r\n--b1\r\nContent-Type: text/html\r\n\r\n<p>Your code is <b>123456</b></p>\r\n--b1--\r\n";

        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.text_body.as_deref().map(str::trim), Some("Your code is 123456"));
        assert_eq!(
            parsed.html_body.as_deref().map(str::trim),
            Some("<p>Your code is <b>123456</b></p>")
        );
    }

    #[test]
    fn test_parse_email_with_attachment() {
        let message = b"Subject: Report\r\nContent-Type: multipart/mixed; boundary=\"bound\"\r\n\r\n--bound\r\nContent-Type: text/plain\r\n\r\nBody\r\n--bound\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"file.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nSGVsbG8gV29ybGQ=\r\n--bound--\r\n";

        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.attachment_count(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("file.pdf"));
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.body, b"Hello World");
    }

    #[test]
    fn test_parse_cc_and_bcc() {
        let message = b"From: a@localhost\r\nTo: b@external.com\r\nCc: Ops <ops@external.com>, c@localhost\r\nBcc: audit@localhost\r\nSubject: x\r\n\r\nbody\r\n";
        let parsed = MimeParser::parse(message).unwrap();

        assert_eq!(parsed.cc, vec!["ops@external.com", "c@localhost"]);
        assert_eq!(parsed.bcc, vec!["audit@localhost"]);
    }
}
