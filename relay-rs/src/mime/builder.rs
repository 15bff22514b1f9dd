use crate::error::{RelayError, Result};
use crate::storage::types::{AttachmentInfo, MessageContent, MessageMetadata};
use mail_builder::headers::address::Address;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;

/// Headers regenerated from metadata or by the MIME writer
const REBUILT_HEADERS: &[&str] = &[
    "bcc",
    "content-disposition",
    "content-transfer-encoding",
    "content-type",
    "date",
    "message-id",
    "mime-version",
    "subject",
];

/// Rebuild a sendable RFC 5322 message from its stored parts
///
/// Address headers are replayed from the stored header block; the envelope
/// only selects recipients and Bcc is dropped.
pub fn compose(
    metadata: &MessageMetadata,
    content: &MessageContent,
    attachments: &[(AttachmentInfo, Vec<u8>)],
) -> Result<Vec<u8>> {
    let mut builder = MessageBuilder::new();

    if !content.headers.contains_key("from") {
        builder = builder.from(Address::new_address(
            None::<&str>,
            metadata.envelope.from.as_str(),
        ));
    }

    for (name, values) in &content.headers {
        if REBUILT_HEADERS.contains(&name.as_str()) {
            continue;
        }
        for value in values.split('\n') {
            builder = builder.header(canonical_name(name), Raw::new(value.to_string()));
        }
    }

    builder = match content.headers.get("date") {
        Some(date) => builder.header("Date", Raw::new(date.clone())),
        None => builder.date(metadata.received_at.timestamp()),
    };

    if let Some(subject) = &metadata.subject {
        builder = builder.subject(subject.as_str());
    }
    if let Some(message_id) = &metadata.message_id {
        builder = builder.message_id(message_id.trim_start_matches('<').trim_end_matches('>'));
    }
    if let Some(text) = &content.text {
        builder = builder.text_body(text.as_str());
    }
    if let Some(html) = &content.html {
        builder = builder.html_body(html.as_str());
    }
    if content.text.is_none() && content.html.is_none() && attachments.is_empty() {
        builder = builder.text_body("");
    }

    for (info, data) in attachments {
        let filename = info.filename.as_deref().unwrap_or("attachment");
        builder = builder.attachment(info.content_type.as_str(), filename, data.clone());
    }

    builder
        .write_to_vec()
        .map_err(|e| RelayError::Parse(format!("Failed to build message: {}", e)))
}

/// `reply-to` -> `Reply-To`
fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::MimeParser;
    use crate::storage::types::{Envelope, SessionInfo};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn metadata() -> MessageMetadata {
        MessageMetadata {
            id: "00000000-0000-0000-0000-000000000000".to_string(),
            received_at: Utc::now(),
            session: SessionInfo::default(),
            envelope: Envelope {
                from: "forms@localhost".to_string(),
                to: vec!["user@external.com".to_string()],
                cc: vec!["ops@external.com".to_string()],
                bcc: vec!["audit@external.com".to_string()],
            },
            subject: Some("Your code".to_string()),
            message_id: Some("abc@relay.local".to_string()),
            size: 0,
            attachments: Vec::new(),
        }
    }

    fn stored_headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_compose_text_and_html() {
        let content = MessageContent {
            headers: stored_headers(&[
                ("from", "forms@localhost"),
                ("to", "user@external.com"),
                ("cc", "ops@external.com"),
                ("bcc", "audit@external.com"),
            ]),
            text: Some("Your code is 123456".to_string()),
            html: Some("<p>Your code is 123456</p>".to_string()),
        };

        let raw = compose(&metadata(), &content, &[]).unwrap();
        let parsed = MimeParser::parse(&raw).unwrap();

        assert_eq!(parsed.subject.as_deref(), Some("Your code"));
        assert_eq!(parsed.message_id.as_deref(), Some("abc@relay.local"));
        assert_eq!(parsed.text_body.as_deref().map(str::trim), Some("Your code is 123456"));
        assert_eq!(
            parsed.html_body.as_deref().map(str::trim),
            Some("<p>Your code is 123456</p>")
        );
        assert_eq!(parsed.cc, vec!["ops@external.com"]);
        assert!(parsed.bcc.is_empty());
    }

    #[test]
    fn test_compose_keeps_attachments() {
        let content = MessageContent {
            text: Some("See attached".to_string()),
            ..Default::default()
        };
        let info = AttachmentInfo {
            filename: Some("invoice.pdf".to_string()),
            stored_name: "000-0123456789abcdef".to_string(),
            content_type: "application/pdf".to_string(),
            size: 4,
        };

        let raw = compose(&metadata(), &content, &[(info, b"%PDF".to_vec())]).unwrap();
        let parsed = MimeParser::parse(&raw).unwrap();

        assert_eq!(parsed.attachment_count(), 1);
        assert_eq!(parsed.attachments[0].filename.as_deref(), Some("invoice.pdf"));
        assert_eq!(parsed.attachments[0].body, b"%PDF");
    }

    #[test]
    fn test_envelope_recipients_not_written_to_headers() {
        let raw_in = b"From: Contact Form <forms@relay.test>\r\nTo: alice@ext.com\r\nBcc: secret@ext.com\r\nReply-To: visitor@ext.com\r\nX-Form-Id: contact\r\nSubject: Hello\r\n\r\nbody\r\n";
        let parsed_in = MimeParser::parse(raw_in).unwrap();
        let mut meta = metadata();
        meta.subject = parsed_in.subject.clone();
        meta.envelope.to = vec!["alice@ext.com".to_string(), "secret@ext.com".to_string()];
        let content = MessageContent {
            headers: parsed_in.headers,
            text: parsed_in.text_body,
            html: None,
        };

        let raw = compose(&meta, &content, &[]).unwrap();
        let text = String::from_utf8_lossy(&raw);
        let parsed = MimeParser::parse(&raw).unwrap();

        assert!(!text.contains("secret@ext.com"), "leaked envelope recipient:\n{}", text);
        assert_eq!(parsed.headers.get("to").map(String::as_str), Some("alice@ext.com"));
        assert!(parsed.headers["from"].contains("Contact Form"));
        assert_eq!(parsed.headers.get("reply-to").map(String::as_str), Some("visitor@ext.com"));
        assert_eq!(parsed.headers.get("x-form-id").map(String::as_str), Some("contact"));
        assert!(parsed.bcc.is_empty());
    }

    #[test]
    fn test_missing_from_header_uses_envelope_sender() {
        let content = MessageContent {
            text: Some("hi".to_string()),
            ..Default::default()
        };

        let raw = compose(&metadata(), &content, &[]).unwrap();
        let parsed = MimeParser::parse(&raw).unwrap();

        assert!(parsed.headers["from"].contains("forms@localhost"));
        assert!(!parsed.headers.contains_key("to"));
    }

    #[test]
    fn test_canonical_header_names() {
        assert_eq!(canonical_name("reply-to"), "Reply-To");
        assert_eq!(canonical_name("x-form-id"), "X-Form-Id");
        assert_eq!(canonical_name("received"), "Received");
    }
}
