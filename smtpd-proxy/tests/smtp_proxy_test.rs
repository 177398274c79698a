//! End-to-end tests over a real TCP connection

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use smtpd_proxy::auth::HardcodedAuth;
use smtpd_proxy::config::Config;
use smtpd_proxy::envelope::Envelope;
use smtpd_proxy::smtp::{Backend, ProxyServer, ServerOptions};
use smtpd_proxy::tls::TlsConfig;
use smtpd_proxy::upstream::{build_registry, Forward, ForwardContext, Forwarder, Registry};
use smtpd_proxy::ForwardError;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const MESSAGE: &str = "From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: Test message\r\n\
\r\n\
Hello from the test suite.\r\n\
..leading dot line\r\n";

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Envelope>>>,
    fail_with: Option<String>,
}

impl Recorder {
    fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forward for Recorder {
    async fn forward(&self, _ctx: &ForwardContext, envelope: &Envelope) -> Result<(), ForwardError> {
        if let Some(message) = &self.fail_with {
            return Err(ForwardError::Smtp(message.clone()));
        }
        self.seen.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

struct TestServer<F> {
    addr: SocketAddr,
    server: Arc<ProxyServer<F>>,
    handle: JoinHandle<smtpd_proxy::Result<()>>,
}

async fn start<F: Forward + 'static>(backend: Backend<F>) -> TestServer<F> {
    start_with_tls(backend, None).await
}

async fn start_with_tls<F: Forward + 'static>(
    backend: Backend<F>,
    tls: Option<TlsConfig>,
) -> TestServer<F> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ProxyServer::new(
        ServerOptions {
            listen: addr.to_string(),
            hostname: "localhost".to_string(),
            tls,
        },
        backend,
    ));

    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move { serving.serve(listener).await });

    TestServer { addr, server, handle }
}

fn recording_backend(recorder: Recorder) -> Backend<Recorder> {
    let registry = Registry::new();
    registry.add_forwarder(recorder, NonZeroU32::new(1).unwrap());
    Backend::new(Arc::new(registry)).with_auth(HardcodedAuth::new("localhost", "user", "password"))
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        let greeting = client.reply().await;
        assert!(greeting.starts_with("220 localhost"), "{}", greeting);
        client
    }

    /// Read one reply, joining multi-line replies
    async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                return reply;
            }
            let last = line.as_bytes().get(3) != Some(&b'-');
            reply.push_str(&line);
            if last {
                return reply;
            }
        }
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.writer.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        self.reply().await
    }

    async fn send_message(&mut self, body: &str) -> String {
        assert!(self.cmd("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        assert!(self.cmd("RCPT TO:<bob@example.com>").await.starts_with("250"));
        assert!(self.cmd("DATA").await.starts_with("354"));
        self.writer.write_all(body.as_bytes()).await.unwrap();
        self.cmd(".").await
    }
}

fn plain(identity: &str, username: &str, password: &str) -> String {
    BASE64.encode(format!("{}\0{}\0{}", identity, username, password))
}

#[tokio::test]
async fn test_ehlo_advertises_auth() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.cmd("EHLO client.example.com").await;
    assert!(reply.starts_with("250-localhost Hello client.example.com"));
    assert!(reply.contains("250-SIZE"));
    assert!(reply.contains("250 AUTH PLAIN LOGIN"));
    // No certificate configured
    assert!(!reply.contains("STARTTLS"));

    assert!(client.cmd("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn test_unauthenticated_mail_is_refused() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.cmd("MAIL FROM:<alice@example.com>").await;
    assert_eq!(
        reply,
        "530 5.7.0 user has not authenticated. anonymous access is not allowed\r\n"
    );
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_anonymous_access() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone()).with_anonymous_access(true)).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.send_message(MESSAGE).await;
    assert!(reply.starts_with("250 2.0.0"), "{}", reply);

    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].subject, "Test message");
    assert_eq!(seen[0].from.as_deref(), Some("alice@example.com"));
    assert_eq!(seen[0].to, vec!["bob@example.com".to_string()]);
    // Dot transparency is undone before forwarding
    assert!(seen[0].text.contains("\n.leading dot line"));
}

#[tokio::test]
async fn test_auth_plain() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.cmd(&format!("AUTH PLAIN {}", plain("", "user", "password"))).await;
    assert!(reply.starts_with("235 2.7.0"), "{}", reply);
    assert!(client.cmd("AUTH PLAIN").await.starts_with("503"));

    assert!(client.send_message(MESSAGE).await.starts_with("250"));
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test]
async fn test_auth_plain_with_challenge() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    assert_eq!(client.cmd("AUTH PLAIN").await, "334 \r\n");
    let reply = client.cmd(&plain("localhost", "user", "password")).await;
    assert!(reply.starts_with("235"), "{}", reply);
}

#[tokio::test]
async fn test_auth_failure_then_retry() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    for _ in 0..12 {
        let reply = client.cmd(&format!("AUTH PLAIN {}", plain("", "user", "wrong"))).await;
        assert_eq!(reply, "535 5.7.8 invalid username or password\r\n");
    }
    assert!(client.cmd("MAIL FROM:<alice@example.com>").await.starts_with("530"));

    // Failed attempts do not count toward the error limit
    let reply = client.cmd(&format!("AUTH PLAIN {}", plain("", "user", "password"))).await;
    assert!(reply.starts_with("235"), "{}", reply);
}

#[tokio::test]
async fn test_auth_identity_mismatch() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain("other.example.com", "user", "password")))
        .await;
    assert_eq!(reply, "535 5.7.8 invalid identity\r\n");
}

#[tokio::test]
async fn test_auth_login() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert_eq!(client.cmd(&BASE64.encode("user")).await, "334 UGFzc3dvcmQ6\r\n");
    let reply = client.cmd(&BASE64.encode("password")).await;
    assert!(reply.starts_with("235"), "{}", reply);

    assert!(client.send_message(MESSAGE).await.starts_with("250"));
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test]
async fn test_auth_cancelled_and_unsupported() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    assert!(client.cmd("AUTH CRAM-MD5").await.starts_with("504 5.5.4"));
    assert!(client.cmd("AUTH ANONYMOUS").await.starts_with("504 5.5.4"));
    assert!(client.cmd("AUTH LOGIN").await.starts_with("334"));
    assert!(client.cmd("*").await.starts_with("501"));
}

#[tokio::test]
async fn test_forward_failure_is_reported() {
    let server = start(
        recording_backend(Recorder::failing("550 5.1.1 mailbox unavailable"))
            .with_anonymous_access(true),
    )
    .await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.send_message(MESSAGE).await;
    assert_eq!(
        reply,
        "451 4.3.0 smtp relay error: 550 5.1.1 mailbox unavailable\r\n"
    );

    // The session survives the failure
    assert!(client.cmd("NOOP").await.starts_with("250"));
}

#[tokio::test]
async fn test_blank_message_is_rejected() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone()).with_anonymous_access(true)).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.send_message("\r\n").await;
    assert!(reply.starts_with("554 5.6.0"), "{}", reply);
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_bad_sequence() {
    let server = start(recording_backend(Recorder::default()).with_anonymous_access(true)).await;
    let mut client = Client::connect(server.addr).await;

    assert!(client.cmd("MAIL FROM:<alice@example.com>").await.starts_with("503"));
    client.cmd("HELO client.example.com").await;
    assert!(client.cmd("DATA").await.starts_with("503"));
    assert!(client.cmd("RCPT TO:<bob@example.com>").await.starts_with("503"));
    assert!(client.cmd("STARTTLS").await.starts_with("502"));
    assert!(client.cmd("VRFY bob").await.starts_with("502"));
}

#[tokio::test]
async fn test_line_too_long() {
    let recorder = Recorder::default();
    let server = start(recording_backend(recorder.clone())).await;
    let mut client = Client::connect(server.addr).await;
    let long_line = "a".repeat(5000);

    let reply = client.cmd(&format!("EHLO {}", long_line)).await;
    assert_eq!(reply, "500 5.5.2 Line too long\r\n");
    assert!(client.cmd("NOOP").await.starts_with("250"));

    client.cmd("EHLO client.example.com").await;
    assert!(client.cmd("AUTH PLAIN").await.starts_with("334"));
    assert_eq!(client.cmd(&long_line).await, "500 5.5.2 Line too long\r\n");
    let reply = client.cmd(&format!("AUTH PLAIN {}", plain("", "user", "password"))).await;
    assert!(reply.starts_with("235"), "{}", reply);

    let reply = client
        .send_message(&format!("Subject: long\r\n\r\n{}\r\n", long_line))
        .await;
    assert_eq!(reply, "500 5.5.2 Line too long\r\n");
    assert!(recorder.seen().is_empty());

    assert!(client.send_message(MESSAGE).await.starts_with("250"));
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test]
async fn test_starttls_offered_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
    let tls = TlsConfig::from_pem_files(&cert_path, &key_path).unwrap();

    let server = start_with_tls(recording_backend(Recorder::default()), Some(tls)).await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.cmd("EHLO client.example.com").await;
    assert!(reply.contains("250-STARTTLS"), "{}", reply);
    assert!(client.cmd("STARTTLS").await.starts_with("220 2.0.0"));
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = start(recording_backend(Recorder::default())).await;
    let mut client = Client::connect(server.addr).await;
    client.cmd("EHLO client.example.com").await;

    server.server.shutdown();
    let reply = client.reply().await;
    assert!(reply.starts_with("421"), "{}", reply);

    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(TcpStream::connect(server.addr).await.is_err());
}

#[tokio::test]
async fn test_log_sink_from_config() {
    let config = Config::parse(
        r#"
        [server]
        listen = "127.0.0.1:0"
        is_anon_auth_allowed = true

        [[upstream]]
        type = "log-sink"
        weight = 3
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let registry = build_registry(&config.upstream).unwrap();
    assert_eq!(registry.total_weight(), 3);

    let backend: Backend<Forwarder> =
        Backend::new(Arc::new(registry)).with_anonymous_access(config.server.is_anon_auth_allowed);
    let server = start(backend).await;
    let mut client = Client::connect(server.addr).await;

    client.cmd("EHLO client.example.com").await;
    assert!(client.send_message(MESSAGE).await.starts_with("250 2.0.0"));
}

#[tokio::test]
async fn test_smtp_relay_upstream() {
    // Downstream proxy stands in for the remote relay
    let recorder = Recorder::default();
    let downstream = start(recording_backend(recorder.clone()).with_anonymous_access(true)).await;

    let config = Config::parse(&format!(
        r#"
        [[upstream]]
        type = "smtp-relay"
        weight = 1

        [upstream.settings]
        addr = "{}"
        tls = "none"
        "#,
        downstream.addr
    ))
    .unwrap();
    let registry = build_registry(&config.upstream).unwrap();

    let upstream = start(Backend::new(Arc::new(registry)).with_anonymous_access(true)).await;
    let mut client = Client::connect(upstream.addr).await;

    client.cmd("EHLO client.example.com").await;
    let reply = client.send_message(MESSAGE).await;
    assert!(reply.starts_with("250 2.0.0"), "{}", reply);

    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].subject, "Test message");
    assert_eq!(seen[0].to, vec!["bob@example.com".to_string()]);
}
