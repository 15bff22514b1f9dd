//! Outbound transport to the upstream relay

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, info};

/// Hands a finished message to the next hop
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, from: &str, recipients: &[String], message: &[u8]) -> Result<()>;
}

/// SMTP submission to the configured upstream relay
pub struct UpstreamTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl UpstreamTransport {
    pub fn new(config: &UpstreamConfig, timeout: Duration) -> Result<Self> {
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| RelayError::Config(format!("Invalid upstream relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port).timeout(Some(timeout));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            "Upstream relay: {}:{} (starttls: {}, auth: {})",
            config.host,
            config.port,
            config.starttls,
            config.username.is_some()
        );

        Ok(Self {
            mailer: builder.build(),
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl Transport for UpstreamTransport {
    async fn send(&self, from: &str, recipients: &[String], message: &[u8]) -> Result<()> {
        let envelope = build_envelope(from, recipients)?;

        debug!("Sending {} bytes to {} via {}", message.len(), recipients.join(", "), self.host);

        let response = self
            .mailer
            .send_raw(&envelope, message)
            .await
            .map_err(|e| RelayError::Delivery(e.to_string()))?;

        debug!("Upstream accepted message: {:?}", response.code());
        Ok(())
    }
}

/// Envelope for lettre; an empty sender is the null reverse-path
fn build_envelope(from: &str, recipients: &[String]) -> Result<Envelope> {
    let sender = if from.is_empty() {
        None
    } else {
        Some(
            from.parse::<Address>()
                .map_err(|e| RelayError::InvalidEmail(format!("{}: {}", from, e)))?,
        )
    };

    let to = recipients
        .iter()
        .map(|r| {
            r.parse::<Address>()
                .map_err(|e| RelayError::InvalidEmail(format!("{}: {}", r, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    Envelope::new(sender, to).map_err(|e| RelayError::Delivery(format!("Invalid envelope: {}", e)))
}
