use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

use crate::auth::{decode_login_credential, decode_plain_auth, AuthMechanism};
use crate::error::{AuthError, ProxyError, Result};
use crate::smtp::backend::Session;
use crate::smtp::commands::SmtpCommand;
use crate::tls::TlsConfig;
use crate::upstream::{Forward, Forwarder};

/// Maximum accepted message size in bytes
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 50;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Timeout for reading a command line
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

#[derive(Debug, PartialEq)]
enum LineRead {
    Eof,
    Line,
    /// Consumed through its newline, but only a prefix was kept
    TooLong,
}

/// Read one line (newline included) into `line`, keeping at most `limit`
/// bytes. An over-long line is drained up to its newline without being
/// buffered.
async fn read_limited_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut too_long = false;

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            if !too_long && line.len() + chunk.len() <= limit {
                line.extend_from_slice(chunk);
            } else {
                too_long = true;
            }
            (chunk.len(), done)
        };
        reader.consume(used);
        consumed += used;
        if done {
            break;
        }
    }

    Ok(match (consumed, too_long) {
        (0, _) => LineRead::Eof,
        (_, true) => LineRead::TooLong,
        _ => LineRead::Line,
    })
}

/// Plain TCP, or TLS after STARTTLS
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Only while the handshake runs
    Upgrading,
}

fn upgrading_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "stream unavailable during STARTTLS upgrade",
    )
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
}

enum SessionResult {
    /// Restart the command loop on the upgraded stream
    Continue,
    Quit,
}

/// Longest error text placed in a reply line
const MAX_REPLY_TEXT: usize = 400;

/// Error text as a single reply line: CR/LF and other control characters
/// become spaces, runs of whitespace collapse, long text is cut off.
fn reply_text(error: &ProxyError) -> String {
    let text = error.to_string();
    let mut words = text
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|word| !word.is_empty());

    let mut out = String::new();
    if let Some(first) = words.next() {
        out.push_str(first);
    }
    for word in words {
        out.push(' ');
        out.push_str(word);
    }
    if out.chars().count() > MAX_REPLY_TEXT {
        out = out.chars().take(MAX_REPLY_TEXT).collect();
        out.push_str("...");
    }
    out
}

/// SMTP reply for an error coming out of the session
pub fn error_reply(error: &ProxyError) -> String {
    let code = match error {
        ProxyError::Unauthorized => "530 5.7.0",
        ProxyError::Authentication(AuthError::UnsupportedMechanism) => "504 5.5.4",
        ProxyError::Authentication(AuthError::Malformed(_)) => "501 5.5.2",
        ProxyError::Authentication(_) => "535 5.7.8",
        ProxyError::EnvelopeParse(_) => "554 5.6.0",
        ProxyError::SmtpProtocol(_) => "501 5.5.2",
        _ => "451 4.3.0",
    };
    format!("{} {}\r\n", code, reply_text(error))
}

/// Drives one client connection, translating SMTP commands into calls on
/// its [`Session`]. Envelope assembly (MAIL/RCPT bookkeeping) lives here.
pub struct Connection<F = Forwarder> {
    session: Session<F>,
    hostname: String,
    tls_config: Option<TlsConfig>,
    state: SmtpState,
    from: Option<String>,
    to: Vec<String>,
    error_count: usize,
    is_encrypted: bool,
}

impl<F: Forward> Connection<F> {
    pub fn new(session: Session<F>, hostname: String, tls_config: Option<TlsConfig>) -> Self {
        Self {
            session,
            hostname,
            tls_config,
            state: SmtpState::Fresh,
            from: None,
            to: Vec::new(),
            error_count: 0,
            is_encrypted: false,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut smtp_stream = SmtpStream::Plain(stream);

        smtp_stream
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.hostname).as_bytes())
            .await?;

        loop {
            match self.process_commands(&mut smtp_stream).await {
                Ok(SessionResult::Continue) => continue,
                Ok(SessionResult::Quit) => break,
                Err(e) => {
                    self.session.logout();
                    return Err(e);
                }
            }
        }

        self.session.logout();
        let _ = smtp_stream.shutdown().await;
        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        let shutdown = self.session.cancellation().clone();
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut line = Vec::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                buf_reader
                    .write_all(b"421 4.7.0 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(SessionResult::Quit);
            }

            line.clear();

            let read_result = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = timeout(
                    COMMAND_TIMEOUT,
                    read_limited_line(&mut buf_reader, &mut line, MAX_LINE_LENGTH),
                ) => Some(result),
            };

            let Some(read_result) = read_result else {
                info!("Server shutting down, closing connection");
                buf_reader
                    .write_all(format!("421 4.3.2 {} Service shutting down\r\n", self.hostname).as_bytes())
                    .await?;
                return Ok(SessionResult::Quit);
            };

            let read = match read_result {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!("IO error reading line: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    buf_reader
                        .write_all(b"421 4.4.2 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(SessionResult::Quit);
                }
            };

            match read {
                LineRead::Eof => {
                    debug!("Client disconnected");
                    return Ok(SessionResult::Quit);
                }
                LineRead::TooLong => {
                    error!("Line too long (max {} bytes)", MAX_LINE_LENGTH);
                    buf_reader.write_all(b"500 5.5.2 Line too long\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
                LineRead::Line => {}
            }

            let line_text = String::from_utf8_lossy(&line);
            let line_trimmed = line_text.trim_end();

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    buf_reader
                        .write_all(b"500 5.5.2 Syntax error, command unrecognized\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            // Credentials must not end up in the logs
            match &cmd {
                SmtpCommand::Auth(mechanism, _) => debug!("Received: AUTH {}", mechanism),
                _ => debug!("Received: {}", line_trimmed),
            }

            match cmd {
                SmtpCommand::Starttls => {
                    if self.tls_config.is_none() {
                        buf_reader
                            .write_all(b"502 5.5.1 STARTTLS not available\r\n")
                            .await?;
                        self.error_count += 1;
                        continue;
                    }
                    if self.is_encrypted {
                        buf_reader.write_all(b"503 5.5.1 TLS already active\r\n").await?;
                        self.error_count += 1;
                        continue;
                    }

                    // Anything the client pipelined after STARTTLS is discarded
                    drop(buf_reader);
                    self.upgrade_tls(stream).await?;
                    return Ok(SessionResult::Continue);
                }
                SmtpCommand::Auth(mechanism, initial_response) => {
                    let reply = self
                        .handle_auth(&mechanism, initial_response, &mut buf_reader)
                        .await?;
                    buf_reader.write_all(reply.as_bytes()).await?;
                }
                SmtpCommand::Data => {
                    let reply = self.handle_data_command();
                    buf_reader.write_all(reply.as_bytes()).await?;
                    if reply.starts_with("354") {
                        let reply = match self.receive_data(&mut buf_reader).await? {
                            Some(reply) => reply,
                            None => return Ok(SessionResult::Quit),
                        };
                        buf_reader.write_all(reply.as_bytes()).await?;
                    } else if reply.starts_with("50") {
                        self.error_count += 1;
                    }
                }
                cmd => {
                    let quit = matches!(cmd, SmtpCommand::Quit);
                    let reply = self.handle_command(cmd);
                    buf_reader.write_all(reply.as_bytes()).await?;

                    if quit {
                        return Ok(SessionResult::Quit);
                    }
                    if reply.starts_with("50") {
                        self.error_count += 1;
                    }
                }
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.to.clear();
        if self.state != SmtpState::Fresh {
            self.state = SmtpState::Greeted;
        }
    }

    fn ehlo_reply(&self, domain: &str) -> String {
        let mut lines = vec![
            format!("{} Hello {}", self.hostname, domain),
            format!("SIZE {}", MAX_MESSAGE_SIZE),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
        ];

        if self.tls_config.is_some() && !self.is_encrypted {
            lines.push("STARTTLS".to_string());
        }

        let mechanisms: Vec<&str> = self
            .session
            .auth_mechanisms()
            .iter()
            .map(AuthMechanism::as_str)
            .collect();
        lines.push(format!("AUTH {}", mechanisms.join(" ")));

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("250{}{}\r\n", if i == last { ' ' } else { '-' }, line))
            .collect()
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("HELO from {}", domain);
                self.state = SmtpState::Greeted;
                self.reset_transaction();
                format!("250 {} Hello {}\r\n", self.hostname, domain)
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {}", domain);
                self.state = SmtpState::Greeted;
                self.reset_transaction();
                self.ehlo_reply(&domain)
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom(from)) => match self.session.mail(&from) {
                Ok(()) => {
                    self.from = Some(from);
                    self.to.clear();
                    self.state = SmtpState::MailFrom;
                    "250 2.1.0 OK\r\n".to_string()
                }
                Err(e) => error_reply(&e),
            },
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if self.to.len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.to.len());
                    return format!("452 4.5.3 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }
                match self.session.rcpt(&to) {
                    Ok(()) => {
                        self.to.push(to);
                        self.state = SmtpState::RcptTo;
                        "250 2.1.5 OK\r\n".to_string()
                    }
                    Err(e) => error_reply(&e),
                }
            }
            (_, SmtpCommand::Rset) => {
                self.reset_transaction();
                self.session.reset();
                "250 2.0.0 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 2.0.0 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => {
                info!("QUIT command");
                self.session.logout();
                format!("221 2.0.0 {} closing connection\r\n", self.hostname)
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("Unknown command: {}", cmd);
                "502 5.5.2 Command not implemented\r\n".to_string()
            }
            _ => "503 5.5.1 Bad sequence of commands\r\n".to_string(),
        }
    }

    fn handle_data_command(&self) -> String {
        if self.state != SmtpState::RcptTo {
            return "503 5.5.1 Bad sequence of commands\r\n".to_string();
        }
        if !self.session.may_submit() {
            return error_reply(&ProxyError::Unauthorized);
        }
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
    }

    /// Read the DATA payload and hand it to the session.
    ///
    /// Returns the reply to send, or `None` when the connection should close.
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;
        let mut line_too_long = false;

        loop {
            line.clear();

            let read = match timeout(
                DATA_TIMEOUT,
                read_limited_line(buf_reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!("IO error during DATA: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("DATA timeout");
                    self.reset_transaction();
                    buf_reader
                        .write_all(b"421 4.4.2 Timeout during DATA, closing connection\r\n")
                        .await?;
                    return Ok(None);
                }
            };

            match read {
                LineRead::Eof => {
                    return Err(ProxyError::SmtpProtocol(
                        "Connection closed during DATA".to_string(),
                    ));
                }
                LineRead::TooLong => {
                    line_too_long = true;
                    continue;
                }
                LineRead::Line => {}
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            // Transparency: a leading dot was doubled by the client
            let content = if line.first() == Some(&b'.') { &line[1..] } else { &line[..] };

            if data.len() + content.len() > MAX_MESSAGE_SIZE {
                too_large = true;
            }
            if !too_large && !line_too_long {
                data.extend_from_slice(content);
            }
        }

        self.reset_transaction();

        if too_large {
            warn!("Message too large (max {} bytes)", MAX_MESSAGE_SIZE);
            return Ok(Some(format!(
                "552 5.3.4 Message too large (max {} bytes)\r\n",
                MAX_MESSAGE_SIZE
            )));
        }
        if line_too_long {
            warn!("DATA line too long");
            return Ok(Some("500 5.5.2 Line too long\r\n".to_string()));
        }

        info!("End of DATA received, total size: {} bytes", data.len());
        let reply = match self.session.data(&data).await {
            Ok(()) => "250 2.0.0 OK: queued\r\n".to_string(),
            Err(e) => error_reply(&e),
        };
        Ok(Some(reply))
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.session.is_authorized() {
            return Ok("503 5.5.1 Already authenticated\r\n".to_string());
        }
        if self.state != SmtpState::Greeted {
            return Ok("503 5.5.1 Bad sequence of commands\r\n".to_string());
        }

        let mechanism = match self.session.auth_mechanism(mechanism) {
            Ok(m) => m,
            Err(e) => return Ok(error_reply(&e)),
        };

        info!("AUTH {} initiated", mechanism.as_str());

        let result = match mechanism {
            AuthMechanism::Plain => {
                let auth_data = match initial_response {
                    Some(data) => data,
                    None => match read_auth_response(buf_reader, "334 \r\n").await? {
                        AuthAnswer::Data(data) => data,
                        other => return Ok(other.abort_reply()),
                    },
                };

                match decode_plain_auth(&auth_data) {
                    Ok((identity, username, password)) => {
                        self.session.auth_plain(&identity, &username, &password)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            AuthMechanism::Login => {
                // base64 "Username:" and "Password:"
                let username = match initial_response {
                    Some(data) => data,
                    None => match read_auth_response(buf_reader, "334 VXNlcm5hbWU6\r\n").await? {
                        AuthAnswer::Data(data) => data,
                        other => return Ok(other.abort_reply()),
                    },
                };
                let username = match decode_login_credential(&username) {
                    Ok(username) => username,
                    Err(e) => return Ok(error_reply(&e.into())),
                };

                let password = match read_auth_response(buf_reader, "334 UGFzc3dvcmQ6\r\n").await? {
                    AuthAnswer::Data(data) => data,
                    other => return Ok(other.abort_reply()),
                };
                match decode_login_credential(&password) {
                    Ok(password) => self.session.auth_login(&username, &password),
                    Err(e) => Err(e.into()),
                }
            }
        };

        Ok(match result {
            Ok(()) => "235 2.7.0 Authentication successful\r\n".to_string(),
            Err(e) => error_reply(&e),
        })
    }

    async fn upgrade_tls(&mut self, stream: &mut SmtpStream) -> Result<()> {
        let tls_config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                return Err(ProxyError::Tls("TLS not configured".to_string()));
            }
        };

        stream.write_all(b"220 2.0.0 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(ProxyError::Tls("TLS already active".to_string()));
            }
        };

        info!("STARTTLS: Performing TLS handshake");
        let tls_stream = tls_config
            .acceptor()
            .accept(tcp_stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("TLS handshake failed: {}", e)))?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.is_encrypted = true;

        // Client must send EHLO again and re-authenticate (RFC 3207)
        self.state = SmtpState::Fresh;
        self.reset_transaction();
        self.session.logout();

        info!("STARTTLS: TLS upgrade completed successfully");
        Ok(())
    }
}

/// Client answer to an AUTH challenge
enum AuthAnswer {
    Data(String),
    Cancelled,
    TooLong,
}

impl AuthAnswer {
    /// Reply ending the exchange when there is no data to decode
    fn abort_reply(&self) -> String {
        match self {
            AuthAnswer::TooLong => "500 5.5.2 Line too long\r\n".to_string(),
            _ => "501 5.7.0 Authentication cancelled\r\n".to_string(),
        }
    }
}

/// Send a 334 challenge and read the client's answer; `None` if the client
/// cancelled with `*`
async fn read_auth_response<S>(
    buf_reader: &mut BufReader<S>,
    challenge: &str,
) -> Result<AuthAnswer>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    buf_reader.write_all(challenge.as_bytes()).await?;

    let mut line = Vec::new();
    let read = timeout(
        COMMAND_TIMEOUT,
        read_limited_line(buf_reader, &mut line, MAX_LINE_LENGTH),
    )
    .await
    .map_err(|_| ProxyError::SmtpProtocol("AUTH timeout".to_string()))??;

    match read {
        LineRead::Eof => Err(ProxyError::SmtpProtocol(
            "Connection closed during AUTH".to_string(),
        )),
        LineRead::TooLong => Ok(AuthAnswer::TooLong),
        LineRead::Line => {
            let response = String::from_utf8_lossy(&line);
            let response = response.trim();
            if response == "*" {
                Ok(AuthAnswer::Cancelled)
            } else {
                Ok(AuthAnswer::Data(response.to_string()))
            }
        }
    }
}
