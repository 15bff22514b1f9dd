use crate::error::Result;
use crate::security::TlsConfig;
use crate::smtp::handler::SessionHandler;
use crate::smtp::session::{SessionConfig, SmtpSession};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct SmtpServer {
    listener: TcpListener,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    tls: Option<TlsConfig>,
}

impl SmtpServer {
    /// Bind the listener; with `tls` every accepted socket is wrapped before the greeting
    pub async fn bind(
        listen_addr: &str,
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
        tls: Option<TlsConfig>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(
            "SMTP server listening on {} (implicit TLS: {})",
            listener.local_addr()?,
            tls.is_some()
        );

        Ok(Self {
            listener,
            config,
            handler,
            tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let (mut socket, addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("SMTP server stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let guard = match self.handler.on_connect(addr).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("Refusing connection from {}: {}", addr, e);
                    let _ = socket
                        .write_all(b"421 Too many connections, try again later\r\n")
                        .await;
                    let _ = socket.shutdown().await;
                    continue;
                }
            };

            info!("New SMTP connection from {}", addr);

            let config = self.config.clone();
            let handler = Arc::clone(&self.handler);
            let acceptor = self.tls.as_ref().map(TlsConfig::acceptor);

            tokio::spawn(async move {
                let _guard = guard;

                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => {
                            SmtpSession::new(config, handler, addr, true).handle(stream).await
                        }
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", addr, e);
                            return;
                        }
                    },
                    None => SmtpSession::new(config, handler, addr, false).handle(socket).await,
                };

                if let Err(e) = result {
                    error!("Session error from {}: {}", addr, e);
                }
                debug!("Connection from {} closed", addr);
            });
        }
    }
}
