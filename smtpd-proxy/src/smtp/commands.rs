use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Mechanism name and optional initial response
    Auth(String, Option<String>),
    Starttls,
    /// Reverse path; empty for the null sender `<>`
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProxyError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(ProxyError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(ProxyError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "AUTH" => {
                let mut auth_args = args.split_whitespace();
                let mechanism = auth_args.next().ok_or_else(|| {
                    ProxyError::SmtpProtocol("AUTH requires mechanism".to_string())
                })?;
                let initial_response = auth_args.next().map(str::to_string);
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial_response))
            }
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(ProxyError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<path> [params]` / `TO:<path> [params]`; ESMTP parameters
    /// such as SIZE or BODY are accepted and ignored
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        let syntax_error = || ProxyError::SmtpProtocol(format!("Invalid {} syntax", prefix.trim_end_matches(':')));

        let rest = match (args.get(..prefix.len()), args.get(prefix.len()..)) {
            (Some(head), Some(rest)) if head.eq_ignore_ascii_case(prefix) => rest.trim_start(),
            _ => return Err(syntax_error()),
        };
        let path = if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>').ok_or_else(syntax_error)?;
            &stripped[..end]
        } else {
            rest.split_whitespace().next().unwrap_or("")
        };

        Ok(path.to_string())
    }
}
