//! `cloud-email-api` upstream: AWS SES v2 `SendEmail`
//!
//! Messages without attachments are sent in the `Simple` form built from the
//! parsed subject and bodies. Anything with attachments is sent `Raw`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::sigv4::{self, CanonicalRequest, SigningParams};
use super::{decode_settings, Forward, ForwardContext, UpstreamKind};
use crate::config::Settings;
use crate::envelope::Envelope;
use crate::error::{ForwardError, ProxyError, Result};

const SERVICE: &str = "ses";
const SEND_EMAIL_PATH: &str = "/v2/email/outbound-emails";
const CHARSET: &str = "UTF-8";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SesSettings {
    aws_access_key_id: String,
    aws_secret_access_key: String,
    region: String,
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest {
    from_email_address: String,
    destination: Destination,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reply_to_addresses: Vec<String>,
    content: EmailContent,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct Destination {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    to_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc_addresses: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
enum EmailContent {
    Simple(SimpleMessage),
    Raw(RawMessage),
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct SimpleMessage {
    subject: Content,
    body: Body,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct Body {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<Content>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct Content {
    data: String,
    charset: String,
}

impl Content {
    fn utf8(data: &str) -> Self {
        Self {
            data: data.to_string(),
            charset: CHARSET.to_string(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct RawMessage {
    /// Base64 of the complete MIME message
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailResponse {
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(alias = "Message")]
    message: String,
}

impl SendEmailRequest {
    fn from_envelope(envelope: &Envelope) -> std::result::Result<Self, ForwardError> {
        let from = envelope
            .from
            .clone()
            .ok_or(ForwardError::MissingSender)?;
        if envelope.recipients().next().is_none() {
            return Err(ForwardError::MissingRecipients);
        }

        if envelope.has_attachments() {
            return Ok(Self {
                from_email_address: from,
                destination: Destination {
                    to_addresses: envelope
                        .to
                        .iter()
                        .chain(&envelope.bcc)
                        .chain(&envelope.cc)
                        .cloned()
                        .collect(),
                    ..Default::default()
                },
                reply_to_addresses: Vec::new(),
                content: EmailContent::Raw(RawMessage {
                    data: BASE64.encode(&envelope.raw),
                }),
            });
        }

        let non_empty = |s: &str| (!s.is_empty()).then(|| Content::utf8(s));
        Ok(Self {
            from_email_address: from,
            destination: Destination {
                to_addresses: envelope.to.clone(),
                cc_addresses: envelope.cc.clone(),
                bcc_addresses: envelope.bcc.clone(),
            },
            reply_to_addresses: envelope.reply_to.clone(),
            content: EmailContent::Simple(SimpleMessage {
                subject: Content::utf8(&envelope.subject),
                body: Body {
                    text: non_empty(&envelope.text),
                    html: non_empty(&envelope.html),
                },
            }),
        })
    }
}

/// Sends messages through the SES v2 HTTP API
pub struct SesForwarder {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    url: Url,
    host: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for SesForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SesForwarder")
            .field("region", &self.region)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl SesForwarder {
    pub fn configure(settings: &Settings) -> Result<Self> {
        let settings: SesSettings = decode_settings(UpstreamKind::CloudEmailApi, settings)?;

        for (name, value) in [
            ("aws_access_key_id", &settings.aws_access_key_id),
            ("aws_secret_access_key", &settings.aws_secret_access_key),
            ("region", &settings.region),
        ] {
            if value.trim().is_empty() {
                return Err(ProxyError::Config(format!("{} must not be empty", name)));
            }
        }

        let endpoint = settings
            .endpoint
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("https://email.{}.amazonaws.com", settings.region));
        let mut url = Url::parse(&endpoint)
            .map_err(|e| ProxyError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::Config(format!(
                "invalid endpoint {}: unsupported scheme {}",
                endpoint,
                url.scheme()
            )));
        }
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ProxyError::Config(format!(
                    "invalid endpoint {}: missing host",
                    endpoint
                )))
            }
        };
        let path = format!("{}{}", url.path().trim_end_matches('/'), SEND_EMAIL_PATH);
        url.set_path(&path);

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            access_key_id: settings.aws_access_key_id,
            secret_access_key: settings.aws_secret_access_key,
            region: settings.region,
            url,
            host,
            client,
        })
    }

    async fn send(&self, payload: Vec<u8>) -> std::result::Result<String, ForwardError> {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("content-type".to_string(), "application/json".to_string());

        let signature = sigv4::sign(
            &SigningParams {
                access_key_id: &self.access_key_id,
                secret_access_key: &self.secret_access_key,
                region: &self.region,
                service: SERVICE,
                timestamp: chrono::Utc::now(),
            },
            &CanonicalRequest {
                method: "POST",
                path: self.url.path(),
                query: "",
                headers: &headers,
                payload: &payload,
            },
        );

        let response = self
            .client
            .post(self.url.clone())
            .header("content-type", "application/json")
            .header("x-amz-date", &signature.amz_date)
            .header("authorization", &signature.authorization)
            .body(payload)
            .send()
            .await
            .map_err(|e| ForwardError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ForwardError::Http(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            return Err(ForwardError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(serde_json::from_str::<SendEmailResponse>(&body)
            .map(|r| r.message_id)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Forward for SesForwarder {
    async fn forward(
        &self,
        ctx: &ForwardContext,
        envelope: &Envelope,
    ) -> std::result::Result<(), ForwardError> {
        let request = SendEmailRequest::from_envelope(envelope)?;
        let payload = serde_json::to_vec(&request).map_err(|e| ForwardError::Http(e.to_string()))?;

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(ForwardError::Cancelled),
            result = self.send(payload) => {
                let message_id = result?;
                debug!(uid = %ctx.uid(), message_id = %message_id, "message accepted by email API");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Attachment;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn settings(value: serde_json::Value) -> Settings {
        value.as_object().cloned().unwrap()
    }

    fn envelope() -> Envelope {
        Envelope {
            from: Some("alice@example.com".to_string()),
            to: vec!["bob@example.com".to_string()],
            cc: vec!["carol@example.com".to_string()],
            bcc: vec!["dave@example.com".to_string()],
            reply_to: vec!["replies@example.com".to_string()],
            subject: "hello".to_string(),
            text: "plain body".to_string(),
            raw: b"Subject: hello\r\n\r\nplain body\r\n".to_vec(),
            ..Default::default()
        }
    }

    /// Accepts one HTTP request, answers with `status` and `body`, returns
    /// the request head and body
    async fn one_shot_http(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            let (head, body_start) = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break (String::from_utf8_lossy(&buffer[..pos]).to_string(), pos + 4);
                }
            };
            let length: usize = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buffer.len() < body_start + length {
                let n = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..n]);
            }
            let request_body = String::from_utf8_lossy(&buffer[body_start..body_start + length]).to_string();

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            (head, request_body)
        });

        (endpoint, handle)
    }

    #[test]
    fn test_simple_request() {
        let request = SendEmailRequest::from_envelope(&envelope()).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["FromEmailAddress"], "alice@example.com");
        assert_eq!(json["Destination"]["ToAddresses"][0], "bob@example.com");
        assert_eq!(json["Destination"]["CcAddresses"][0], "carol@example.com");
        assert_eq!(json["Destination"]["BccAddresses"][0], "dave@example.com");
        assert_eq!(json["ReplyToAddresses"][0], "replies@example.com");
        assert_eq!(json["Content"]["Simple"]["Subject"]["Data"], "hello");
        assert_eq!(json["Content"]["Simple"]["Subject"]["Charset"], "UTF-8");
        assert_eq!(json["Content"]["Simple"]["Body"]["Text"]["Data"], "plain body");
        assert!(json["Content"]["Simple"]["Body"].get("Html").is_none());
    }

    #[test]
    fn test_raw_request_with_attachments() {
        let mut envelope = envelope();
        envelope.attachments.push(Attachment {
            filename: Some("a.txt".to_string()),
            content_type: "text/plain".to_string(),
            content: b"abc".to_vec(),
        });

        let request = SendEmailRequest::from_envelope(&envelope).unwrap();
        assert_eq!(
            request.destination.to_addresses,
            vec!["bob@example.com", "dave@example.com", "carol@example.com"]
        );
        match request.content {
            EmailContent::Raw(raw) => assert_eq!(raw.data, BASE64.encode(&envelope.raw)),
            other => panic!("expected raw content, got {:?}", other),
        }
    }

    #[test]
    fn test_request_needs_sender_and_recipients() {
        let mut no_sender = envelope();
        no_sender.from = None;
        assert!(matches!(
            SendEmailRequest::from_envelope(&no_sender),
            Err(ForwardError::MissingSender)
        ));

        let no_recipients = Envelope {
            from: Some("alice@example.com".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SendEmailRequest::from_envelope(&no_recipients),
            Err(ForwardError::MissingRecipients)
        ));
    }

    #[test]
    fn test_configure() {
        let ses = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "AKID",
            "aws_secret_access_key": "secret",
            "region": "eu-west-1",
        })))
        .unwrap();
        assert_eq!(
            ses.url.as_str(),
            "https://email.eu-west-1.amazonaws.com/v2/email/outbound-emails"
        );
        assert_eq!(ses.host, "email.eu-west-1.amazonaws.com");

        let err = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "AKID",
            "aws_secret_access_key": "secret",
            "region": "eu-west-1",
            "endpoint": "not a url",
        })))
        .unwrap_err();
        assert!(err.to_string().contains("invalid endpoint"), "{}", err);

        let err = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "",
            "aws_secret_access_key": "secret",
            "region": "eu-west-1",
        })))
        .unwrap_err();
        assert!(err.to_string().contains("aws_access_key_id must not be empty"));
    }

    #[tokio::test]
    async fn test_forward_signs_request() {
        let (endpoint, server) = one_shot_http("200 OK", r#"{"MessageId":"0100-abc"}"#).await;
        let ses = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "AKID",
            "aws_secret_access_key": "secret",
            "region": "us-east-1",
            "endpoint": endpoint,
        })))
        .unwrap();

        let ctx = ForwardContext::new("uid:0001", CancellationToken::new());
        ses.forward(&ctx, &envelope()).await.unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("POST /v2/email/outbound-emails HTTP/1.1"), "{}", head);
        let head = head.to_lowercase();
        assert!(head.contains("authorization: aws4-hmac-sha256 credential=akid/"));
        assert!(head.contains("/us-east-1/ses/aws4_request"));
        assert!(head.contains("signedheaders=content-type;host;x-amz-date"));
        assert!(head.contains("x-amz-date: "));

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["FromEmailAddress"], "alice@example.com");
    }

    #[tokio::test]
    async fn test_forward_reports_api_error() {
        let (endpoint, _server) = one_shot_http(
            "400 Bad Request",
            r#"{"message":"Email address is not verified."}"#,
        )
        .await;
        let ses = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "AKID",
            "aws_secret_access_key": "secret",
            "region": "us-east-1",
            "endpoint": endpoint,
        })))
        .unwrap();

        let ctx = ForwardContext::new("uid:0001", CancellationToken::new());
        match ses.forward(&ctx, &envelope()).await {
            Err(ForwardError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Email address is not verified.");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_observes_cancellation() {
        let ses = SesForwarder::configure(&settings(serde_json::json!({
            "aws_access_key_id": "AKID",
            "aws_secret_access_key": "secret",
            "region": "us-east-1",
            "endpoint": "http://10.255.255.1:9",
        })))
        .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let ctx = ForwardContext::new("uid:0001", token);
        assert!(matches!(
            ses.forward(&ctx, &envelope()).await,
            Err(ForwardError::Cancelled)
        ));
    }
}
