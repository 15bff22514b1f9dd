use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted relay account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    pub is_admin: bool,
    pub created: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub active: bool,
}

/// Account view without credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub username: String,
    pub is_admin: bool,
    pub created: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub active: bool,
}

impl Account {
    pub fn new(username: &str, password_hash: String, is_admin: bool) -> Self {
        Self {
            username: username.to_string(),
            password_hash,
            is_admin,
            created: Utc::now(),
            last_login: None,
            messages_sent: 0,
            active: true,
        }
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            username: self.username.clone(),
            is_admin: self.is_admin,
            created: self.created,
            last_login: self.last_login,
            messages_sent: self.messages_sent,
            active: self.active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_serializes_camel_case() {
        let account = Account::new("admin", "$argon2id$fake".to_string(), true);
        let json = serde_json::to_value(&account).unwrap();

        assert_eq!(json["passwordHash"], "$argon2id$fake");
        assert_eq!(json["isAdmin"], true);
        assert_eq!(json["messagesSent"], 0);
        assert!(json["lastLogin"].is_null());
    }

    #[test]
    fn test_summary_has_no_hash() {
        let account = Account::new("ops", "$argon2id$fake".to_string(), false);
        let json = serde_json::to_string(&account.summary()).unwrap();
        assert!(!json.contains("argon2"));
        assert!(json.contains("\"username\":\"ops\""));
    }
}
