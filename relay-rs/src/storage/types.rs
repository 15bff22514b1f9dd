use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle folder a message lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Incoming,
    Sent,
    Failed,
}

impl Folder {
    pub const ALL: [Folder; 3] = [Folder::Incoming, Folder::Sent, Folder::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Incoming => "incoming",
            Folder::Sent => "sent",
            Folder::Failed => "failed",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Folder::Incoming),
            "sent" => Ok(Folder::Sent),
            "failed" => Ok(Folder::Failed),
            other => Err(format!("not a lifecycle folder: '{}'", other)),
        }
    }
}

/// Connection the message arrived on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// `None` for anonymous sessions
    pub username: Option<String>,
    pub remote_address: String,
    /// Name declared in HELO/EHLO
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    /// Name announced by the sender; never used as a path
    pub filename: Option<String>,
    /// File name under `attachments/`
    pub stored_name: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub session: SessionInfo,
    pub envelope: Envelope,
    pub subject: Option<String>,
    /// `Message-ID` header
    pub message_id: Option<String>,
    pub size: usize,
    #[serde(default)]
    pub attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub headers: BTreeMap<String, String>,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Everything written for a newly accepted message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub metadata: MessageMetadata,
    pub content: MessageContent,
    /// Attachment bodies, in the order of `metadata.attachments`
    pub attachment_data: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub delivered_at: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub failed_at: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub attempts: u32,
    pub last_error: String,
}

/// Metadata together with the folder it was read from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListing {
    pub folder: Folder,
    #[serde(flatten)]
    pub metadata: MessageMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_round_trip_names() {
        for folder in Folder::ALL {
            assert_eq!(folder.as_str().parse::<Folder>().unwrap(), folder);
        }
        assert!("trash".parse::<Folder>().is_err());
    }

    #[test]
    fn test_listing_flattens_metadata() {
        let listing = MessageListing {
            folder: Folder::Sent,
            metadata: MessageMetadata {
                id: "abc".to_string(),
                received_at: Utc::now(),
                session: SessionInfo::default(),
                envelope: Envelope::default(),
                subject: Some("Your code".to_string()),
                message_id: None,
                size: 10,
                attachments: Vec::new(),
            },
        };

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["folder"], "sent");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["subject"], "Your code");
    }
}
