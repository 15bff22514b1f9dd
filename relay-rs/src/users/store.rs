//! JSON-file user store
//!
//! # Security
//! - Passwords hashed with Argon2 (salted, one-way)
//! - Verification compares digests in constant time
//! - Unknown and inactive accounts still pay for a hash verification so
//!   response timing does not reveal which usernames exist
//!
//! # Usage
//! ```no_run
//! use relay_rs::users::UserStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let users = UserStore::open("data/users.json").await?;
//! users.create_account("forms", "s3cret", false).await?;
//! assert!(users.authenticate("forms", "s3cret").await?);
//! # Ok(())
//! # }
//! ```

use crate::error::{RelayError, Result};
use crate::users::types::{Account, AccountSummary};
use crate::utils::write_atomic;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Hash verified when the account is unknown or inactive
static DUMMY_HASH: OnceLock<String> = OnceLock::new();

pub struct UserStore {
    path: PathBuf,
    accounts: Mutex<BTreeMap<String, Account>>,
}

impl UserStore {
    /// Load the account file, starting empty if it does not exist yet
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let accounts = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, Account>>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Loaded {} account(s) from {:?}", accounts.len(), path);

        Ok(Self {
            path,
            accounts: Mutex::new(accounts),
        })
    }

    /// Create the default admin account on first run
    ///
    /// Returns `true` when the account was created.
    pub async fn bootstrap_admin(&self, username: &str, password: &str) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        if !accounts.is_empty() {
            return Ok(false);
        }

        let account = Account::new(username, hash_password(password)?, true);
        let mut updated = accounts.clone();
        updated.insert(username.to_string(), account);
        self.persist(&updated).await?;
        *accounts = updated;

        info!("Created default admin account: {}", username);
        Ok(true)
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<AccountSummary> {
        if username.trim().is_empty() {
            return Err(RelayError::Parse("Username cannot be empty".to_string()));
        }

        let password_hash = hash_password(password)?;

        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(username) {
            warn!("Account already exists: {}", username);
            return Err(RelayError::DuplicateAccount(username.to_string()));
        }

        let account = Account::new(username, password_hash, is_admin);
        let summary = account.summary();
        let mut updated = accounts.clone();
        updated.insert(username.to_string(), account);
        self.persist(&updated).await?;
        *accounts = updated;

        info!("Account created: {} (admin: {})", username, is_admin);
        Ok(summary)
    }

    /// Verify credentials; on success `lastLogin` is updated and persisted
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self.verify(username, password, false).await?.is_some())
    }

    /// Like [`authenticate`](Self::authenticate) but also requires the admin flag
    pub async fn authenticate_admin(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self.verify(username, password, true).await?.is_some())
    }

    async fn verify(
        &self,
        username: &str,
        password: &str,
        require_admin: bool,
    ) -> Result<Option<AccountSummary>> {
        debug!("Authentication attempt for {}", username);

        let mut accounts = self.accounts.lock().await;

        let stored_hash = match accounts.get(username) {
            Some(account) if account.active && (!require_admin || account.is_admin) => {
                Some(account.password_hash.clone())
            }
            _ => None,
        };

        let Some(stored_hash) = stored_hash else {
            // Same cost as a real verification
            let _ = verify_password(password, dummy_hash()?);
            warn!("Authentication failed for {}", username);
            return Ok(None);
        };

        if !verify_password(password, &stored_hash) {
            warn!("Authentication failed for {}", username);
            return Ok(None);
        }

        let summary = self
            .update(&mut accounts, username, |account| {
                account.last_login = Some(Utc::now());
            })
            .await?;

        info!("Authentication successful for {}", username);
        Ok(Some(summary))
    }

    pub async fn record_message_sent(&self, username: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        self.update(&mut accounts, username, |account| account.messages_sent += 1)
            .await
            .map(|_| ())
    }

    /// Soft delete: the account stays on disk with `active=false`
    pub async fn deactivate(&self, username: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        self.update(&mut accounts, username, |account| account.active = false)
            .await?;

        info!("Account deactivated: {}", username);
        Ok(())
    }

    pub async fn reset_password(&self, username: &str, password: &str) -> Result<()> {
        let password_hash = hash_password(password)?;

        let mut accounts = self.accounts.lock().await;
        self.update(&mut accounts, username, |account| {
            account.password_hash = password_hash;
        })
        .await?;

        info!("Password reset for {}", username);
        Ok(())
    }

    pub async fn get(&self, username: &str) -> Option<AccountSummary> {
        self.accounts.lock().await.get(username).map(Account::summary)
    }

    pub async fn list(&self) -> Vec<AccountSummary> {
        self.accounts
            .lock()
            .await
            .values()
            .map(Account::summary)
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.accounts.lock().await.len()
    }

    /// Apply `change` to one account; memory is only updated once the file is written
    async fn update<F>(
        &self,
        accounts: &mut BTreeMap<String, Account>,
        username: &str,
        change: F,
    ) -> Result<AccountSummary>
    where
        F: FnOnce(&mut Account),
    {
        let mut updated = accounts.clone();
        let account = updated
            .get_mut(username)
            .ok_or_else(|| RelayError::AccountNotFound(username.to_string()))?;
        change(account);
        let summary = account.summary();

        self.persist(&updated).await?;
        *accounts = updated;
        Ok(summary)
    }

    async fn persist(&self, accounts: &BTreeMap<String, Account>) -> Result<()> {
        // serde_json pretty printing indents with two spaces
        let json = serde_json::to_vec_pretty(accounts)?;
        write_atomic(&self.path, &json).await
    }
}

/// Hash password with Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RelayError::Config(format!("Failed to hash password: {}", e)))?;

    Ok(password_hash.to_string())
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn dummy_hash() -> Result<&'static str> {
    if let Some(hash) = DUMMY_HASH.get() {
        return Ok(hash.as_str());
    }
    let hash = hash_password("relay-dummy-password")?;
    Ok(DUMMY_HASH.get_or_init(|| hash).as_str())
}
