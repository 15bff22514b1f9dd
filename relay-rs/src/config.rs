use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub upstream: UpstreamConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Relay hostname, used in the greeting and treated as a local domain
    pub hostname: String,
    /// Additional domains delivered locally
    pub local_domains: Vec<String>,
    pub admin_username: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    /// Implicit TLS on accepted sockets
    pub secure: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub allow_insecure_auth: bool,
    pub require_auth: bool,
    pub max_connections: usize,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub max_storage_age_days: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub drain_interval_secs: u64,
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub starttls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise defaults, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Upstream credentials and the admin password come from the environment
    /// when present so they stay out of config files.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("SMTP_RELAY_HOST") {
            self.upstream.host = host;
        }
        if let Ok(port) = std::env::var("SMTP_RELAY_PORT") {
            self.upstream.port = port
                .parse()
                .map_err(|_| RelayError::Config(format!("Invalid SMTP_RELAY_PORT: {}", port)))?;
        }
        if let Ok(user) = std::env::var("SMTP_RELAY_USER") {
            self.upstream.username = Some(user);
        }
        if let Ok(pass) = std::env::var("SMTP_RELAY_PASS") {
            self.upstream.password = Some(pass);
        }
        if let Ok(pass) = std::env::var("RELAY_ADMIN_PASSWORD") {
            self.server.admin_password = pass;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_retries == 0 {
            return Err(RelayError::Config("delivery.max_retries must be at least 1".to_string()));
        }
        if self.smtp.max_connections == 0 {
            return Err(RelayError::Config("smtp.max_connections must be at least 1".to_string()));
        }
        if self.smtp.secure && (self.smtp.tls_cert_path.is_none() || self.smtp.tls_key_path.is_none()) {
            return Err(RelayError::Config(
                "smtp.secure requires tls_cert_path and tls_key_path".to_string(),
            ));
        }
        if self.server.admin_password == ServerConfig::default().admin_password {
            warn!("Default admin password in use, set RELAY_ADMIN_PASSWORD");
        }
        Ok(())
    }

    /// Domains whose recipients never leave the relay
    pub fn local_domains(&self) -> Vec<String> {
        let mut domains = vec![self.server.hostname.clone(), "localhost".to_string()];
        domains.extend(self.server.local_domains.iter().cloned());
        domains
    }
}

impl StorageConfig {
    pub fn users_file(&self) -> PathBuf {
        Path::new(&self.data_dir).join("users.json")
    }

    pub fn messages_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("messages")
    }

    pub fn queue_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("queue")
    }

    pub fn max_storage_age(&self) -> Duration {
        Duration::from_secs(self.max_storage_age_days * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            local_domains: Vec::new(),
            admin_username: "admin".to_string(),
            admin_password: "changeme".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            secure: false,
            tls_cert_path: None,
            tls_key_path: None,
            allow_insecure_auth: true,
            require_auth: true,
            max_connections: 100,
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            max_storage_age_days: 7,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5000,
            drain_interval_secs: 30,
            send_timeout_secs: 30,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            starttls: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8025".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
