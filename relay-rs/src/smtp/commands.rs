use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Help,
    /// `AUTH <mechanism> [initial-response]`
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RelayError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(RelayError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(RelayError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                // Parse MAIL FROM:<address>
                let from = Self::parse_mail_from(args)?;
                Ok(SmtpCommand::MailFrom(from))
            }
            "RCPT" => {
                // Parse RCPT TO:<address>
                let to = Self::parse_rcpt_to(args)?;
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "HELP" => Ok(SmtpCommand::Help),
            "AUTH" => {
                let mut auth_parts = args.split_whitespace();
                let mechanism = auth_parts
                    .next()
                    .ok_or_else(|| RelayError::SmtpProtocol("AUTH requires mechanism".to_string()))?;
                let initial = auth_parts.next().map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    fn parse_mail_from(args: &str) -> Result<String> {
        // Expected format: FROM:<email@domain.com> [SIZE=n BODY=8BITMIME]
        if !args.to_uppercase().starts_with("FROM:") {
            return Err(RelayError::SmtpProtocol("Invalid MAIL FROM syntax".to_string()));
        }

        Self::parse_path(&args[5..])
    }

    fn parse_rcpt_to(args: &str) -> Result<String> {
        // Expected format: TO:<email@domain.com>
        if !args.to_uppercase().starts_with("TO:") {
            return Err(RelayError::SmtpProtocol("Invalid RCPT TO syntax".to_string()));
        }

        Self::parse_path(&args[3..])
    }

    /// Address inside the angle brackets; trailing ESMTP parameters are ignored
    fn parse_path(path: &str) -> Result<String> {
        let path = path.trim();
        if let Some(rest) = path.strip_prefix('<') {
            let end = rest
                .find('>')
                .ok_or_else(|| RelayError::SmtpProtocol("Unterminated address".to_string()))?;
            return Ok(rest[..end].trim().to_string());
        }

        Ok(path.split_whitespace().next().unwrap_or("").to_string())
    }
}
