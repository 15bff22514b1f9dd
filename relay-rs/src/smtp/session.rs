use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::security::auth::{decode_login_credential, decode_plain_auth};
use crate::security::AuthMechanism;
use crate::smtp::commands::SmtpCommand;
use crate::smtp::handler::SessionHandler;
use crate::storage::{Envelope, SessionInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Timeout for reading a command line
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// How a DATA phase ended
enum DataOutcome {
    Complete(Vec<u8>),
    /// Body exceeded the size limit; carries the number of bytes seen
    TooLarge(usize),
}

/// Listener-wide session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_message_size: usize,
    pub require_auth: bool,
    pub allow_insecure_auth: bool,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            max_message_size: config.smtp.max_message_size,
            require_auth: config.smtp.require_auth,
            allow_insecure_auth: config.smtp.allow_insecure_auth,
        }
    }
}

/// SMTP session with security limits
///
/// # Security features
/// - Command timeouts to prevent slowloris attacks
/// - Data size limits to prevent memory exhaustion
/// - Recipient limits
/// - Error counting to detect malicious clients
/// - AUTH refused on plaintext connections unless explicitly allowed
pub struct SmtpSession {
    state: SmtpState,
    from: Option<String>,
    to: Vec<String>,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    error_count: usize,
    is_encrypted: bool,
    authenticated_user: Option<String>,
    helo_domain: Option<String>,
    remote_addr: SocketAddr,
}

impl SmtpSession {
    pub fn new(
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
        remote_addr: SocketAddr,
        is_encrypted: bool,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            from: None,
            to: Vec::new(),
            config,
            handler,
            error_count: 0,
            is_encrypted,
            authenticated_user: None,
            helo_domain: None,
            remote_addr,
        }
    }

    /// Run the session to completion on `stream`
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buf_reader = BufReader::new(stream);

        reply(
            &mut buf_reader,
            &format!("220 {} ESMTP Service Ready\r\n", self.config.hostname),
        )
        .await?;

        let mut line = String::new();

        loop {
            // Check error count (security: disconnect abusive clients)
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors from {}, disconnecting", self.remote_addr);
                reply(&mut buf_reader, "421 Too many errors, closing connection\r\n").await?;
                return Ok(());
            }

            line.clear();

            // Read line with timeout (security: prevent slowloris)
            let n = match timeout(COMMAND_TIMEOUT, buf_reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("IO error reading line: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting {}", self.remote_addr);
                    reply(&mut buf_reader, "421 Timeout, closing connection\r\n").await?;
                    return Ok(());
                }
            };

            if n == 0 {
                debug!("Client {} disconnected", self.remote_addr);
                return Ok(());
            }

            // Check line length (security: prevent buffer overflow)
            if line.len() > MAX_LINE_LENGTH {
                error!("Line too long: {} bytes", line.len());
                reply(&mut buf_reader, "500 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let line_trimmed = line.trim_end();
            if line_trimmed.to_uppercase().starts_with("AUTH ") {
                debug!("Received: AUTH ...");
            } else {
                debug!("Received: {}", line_trimmed);
            }

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    error!("Command parse error: {}", e);
                    reply(&mut buf_reader, "500 Syntax error, command unrecognized\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
            };

            // AUTH needs back-and-forth communication
            if let SmtpCommand::Auth(mechanism, initial_response) = cmd {
                if let Err(e) = self
                    .handle_auth(&mechanism, initial_response, &mut buf_reader)
                    .await
                {
                    error!("AUTH error: {}", e);
                    reply(&mut buf_reader, "535 5.7.8 Authentication failed\r\n").await?;
                    self.error_count += 1;
                }
                continue;
            }

            let response = self.handle_command(cmd).await;
            reply(&mut buf_reader, &response).await?;

            if response.starts_with("221") {
                return Ok(());
            }

            if self.state == SmtpState::Data {
                match self.receive_data(&mut buf_reader).await {
                    Ok(DataOutcome::Complete(data)) => {
                        let response = self.accept_message(data).await;
                        reply(&mut buf_reader, &response).await?;
                    }
                    Ok(DataOutcome::TooLarge(size)) => {
                        warn!(
                            "Message too large: {} bytes (max {})",
                            size, self.config.max_message_size
                        );
                        self.reset_transaction();
                        reply(
                            &mut buf_reader,
                            &format!(
                                "552 5.3.4 Message size exceeds fixed maximum message size ({} bytes)\r\n",
                                self.config.max_message_size
                            ),
                        )
                        .await?;
                    }
                    Err(RelayError::Timeout(what)) => {
                        warn!("{} from {}", what, self.remote_addr);
                        reply(&mut buf_reader, "421 Timeout, closing connection\r\n").await?;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            username: self.authenticated_user.clone(),
            remote_address: self.remote_addr.to_string(),
            hostname: self.helo_domain.clone(),
        }
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.to.clear();
        self.state = SmtpState::Greeted;
    }

    fn auth_allowed(&self) -> bool {
        self.is_encrypted || self.config.allow_insecure_auth
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (&self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("HELO from {}", domain);
                self.reset_transaction();
                self.helo_domain = Some(domain.clone());
                format!("250 {} Hello {}\r\n", self.config.hostname, domain)
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {}", domain);
                self.reset_transaction();
                self.helo_domain = Some(domain.clone());

                let mut response = format!("250-{} Hello {}\r\n", self.config.hostname, domain);
                response.push_str(&format!("250-SIZE {}\r\n", self.config.max_message_size));
                response.push_str("250-8BITMIME\r\n");
                if self.auth_allowed() {
                    response.push_str(&format!("250-AUTH {}\r\n", AuthMechanism::ADVERTISED));
                }
                response.push_str("250 HELP\r\n");
                response
            }
            (
                SmtpState::Greeted | SmtpState::MailFrom | SmtpState::RcptTo,
                SmtpCommand::MailFrom(from),
            ) => {
                if self.config.require_auth && self.authenticated_user.is_none() {
                    warn!("MAIL FROM rejected: authentication required");
                    return "530 5.7.0 Authentication required\r\n".to_string();
                }

                if let Err(e) = self.handler.on_mail_from(&self.session_info(), &from).await {
                    warn!("MAIL FROM <{}> refused: {}", from, e);
                    return "550 Sender rejected\r\n".to_string();
                }

                self.from = Some(from);
                self.to.clear();
                self.state = SmtpState::MailFrom;
                "250 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if to.is_empty() {
                    self.error_count += 1;
                    return "501 Syntax: RCPT TO:<address>\r\n".to_string();
                }

                if self.to.len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.to.len());
                    return format!("452 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }

                if let Err(e) = self.handler.on_rcpt_to(&self.session_info(), &to).await {
                    warn!("RCPT TO <{}> refused: {}", to, e);
                    return "550 Recipient rejected\r\n".to_string();
                }

                self.to.push(to);
                self.state = SmtpState::RcptTo;
                "250 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                info!("DATA command received");
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                info!("RSET command");
                if self.state != SmtpState::Fresh {
                    self.reset_transaction();
                }
                "250 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 OK\r\n".to_string(),
            (_, SmtpCommand::Help) => {
                "214 Commands: HELO EHLO AUTH MAIL RCPT DATA RSET NOOP QUIT HELP\r\n".to_string()
            }
            (_, SmtpCommand::Quit) => {
                info!("QUIT command");
                format!("221 {} closing connection\r\n", self.config.hostname)
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                error!("Unknown command: {}", cmd);
                self.error_count += 1;
                "502 Command not implemented\r\n".to_string()
            }
            _ => {
                error!("Invalid command sequence");
                self.error_count += 1;
                "503 Bad sequence of commands\r\n".to_string()
            }
        }
    }

    /// Read the message body up to the terminating dot line
    ///
    /// An oversized body is read to the end and discarded so the client and
    /// server stay in step.
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<DataOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut seen = 0usize;
        let mut too_large = false;

        loop {
            line.clear();

            let n = match timeout(DATA_TIMEOUT, buf_reader.read_until(b'\n', &mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("IO error during DATA: {}", e);
                    return Err(e.into());
                }
                Err(_) => return Err(RelayError::Timeout("DATA".to_string())),
            };

            if n == 0 {
                return Err(RelayError::SmtpProtocol(
                    "Connection closed during DATA".to_string(),
                ));
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            seen += line.len();
            if seen > self.config.max_message_size {
                too_large = true;
            }
            if too_large {
                continue;
            }

            // Transparency (RFC 5321 4.5.2)
            if line.starts_with(b".") {
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
        }

        if too_large {
            return Ok(DataOutcome::TooLarge(seen));
        }

        info!("End of DATA received, total size: {} bytes", data.len());
        Ok(DataOutcome::Complete(data))
    }

    async fn accept_message(&mut self, data: Vec<u8>) -> String {
        let envelope = Envelope {
            from: self.from.clone().unwrap_or_default(),
            to: self.to.clone(),
            ..Default::default()
        };
        let session = self.session_info();
        self.reset_transaction();

        match self.handler.on_data(&session, &envelope, &data).await {
            Ok(id) => {
                info!("Accepted message {} from {}", id, self.remote_addr);
                format!("250 OK: Message accepted as {}\r\n", id)
            }
            Err(e) => {
                error!("Failed to accept message from {}: {}", self.remote_addr, e);
                "451 4.3.0 Requested action aborted: local error in processing\r\n".to_string()
            }
        }
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.auth_allowed() {
            warn!("AUTH refused on plaintext connection from {}", self.remote_addr);
            reply(
                buf_reader,
                "538 5.7.11 Encryption required for requested authentication mechanism\r\n",
            )
            .await?;
            return Ok(());
        }

        if self.authenticated_user.is_some() {
            reply(buf_reader, "503 Already authenticated\r\n").await?;
            return Ok(());
        }

        if self.state != SmtpState::Greeted {
            reply(buf_reader, "503 Bad sequence of commands\r\n").await?;
            return Ok(());
        }

        let auth_mechanism = match AuthMechanism::parse(mechanism) {
            Some(m) => m,
            None => {
                reply(buf_reader, "504 Authentication mechanism not supported\r\n").await?;
                return Ok(());
            }
        };

        info!("AUTH {} initiated", auth_mechanism.as_str());

        let (username, password) = match auth_mechanism {
            AuthMechanism::Plain => {
                // PLAIN: AUTH PLAIN <base64-credentials>
                let auth_data = match initial_response {
                    Some(data) => data,
                    None => {
                        reply(buf_reader, "334 \r\n").await?;
                        read_auth_line(buf_reader).await?
                    }
                };

                decode_plain_auth(&auth_data)?
            }
            AuthMechanism::Login => {
                // Server sends: 334 VXNlcm5hbWU6 (base64 "Username:")
                let username = match initial_response {
                    Some(data) => decode_login_credential(&data)?,
                    None => {
                        reply(buf_reader, "334 VXNlcm5hbWU6\r\n").await?;
                        decode_login_credential(&read_auth_line(buf_reader).await?)?
                    }
                };

                // Server sends: 334 UGFzc3dvcmQ6 (base64 "Password:")
                reply(buf_reader, "334 UGFzc3dvcmQ6\r\n").await?;
                let password = decode_login_credential(&read_auth_line(buf_reader).await?)?;

                (username, password)
            }
        };

        match self.handler.on_auth(&username, &password).await {
            Ok(()) => {
                info!("Authentication successful for {}", username);
                self.authenticated_user = Some(username);
                reply(buf_reader, "235 2.7.0 Authentication successful\r\n").await?;
            }
            Err(e) => {
                warn!("Authentication failed for {}: {}", username, e);
                reply(buf_reader, "535 5.7.8 Authentication failed\r\n").await?;
                self.error_count += 1;
            }
        }

        Ok(())
    }
}

async fn read_auth_line<S>(buf_reader: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = timeout(COMMAND_TIMEOUT, buf_reader.read_line(&mut line))
        .await
        .map_err(|_| RelayError::Timeout("AUTH".to_string()))??;

    if n == 0 {
        return Err(RelayError::SmtpProtocol("Connection closed during AUTH".to_string()));
    }

    let line = line.trim();
    if line == "*" {
        return Err(RelayError::SmtpProtocol("AUTH cancelled by client".to_string()));
    }
    Ok(line.to_string())
}

async fn reply<S>(buf_reader: &mut BufReader<S>, response: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    buf_reader.write_all(response.as_bytes()).await?;
    buf_reader.flush().await?;
    Ok(())
}
