//! Parsed representation of one accepted message
//!
//! The DATA stream is decoded with `mail-parser`. Routing never looks at the
//! envelope; forwarders read the fields they need and relays that re-send the
//! message as-is use [`Envelope::raw`].

use mail_parser::{Address, MessageParser, MimeHeaders, PartType};

use crate::error::{ProxyError, Result};

/// One attachment of a parsed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Parsed SMTP message
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
    /// DATA payload exactly as received (after dot-unstuffing)
    pub raw: Vec<u8>,
}

impl Envelope {
    /// Parse a raw DATA payload
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ProxyError::EnvelopeParse("empty message".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ProxyError::EnvelopeParse("unable to parse message".to_string()))?;

        if message.headers().is_empty() {
            return Err(ProxyError::EnvelopeParse(
                "message has no headers".to_string(),
            ));
        }

        let html = message
            .html_part(0)
            .filter(|part| matches!(part.body, PartType::Html(_)))
            .and_then(|part| part.text_contents())
            .unwrap_or_default()
            .to_string();

        let attachments = message
            .attachments()
            .map(|part| Attachment {
                filename: part.attachment_name().map(str::to_string),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                content: part.contents().to_vec(),
            })
            .collect();

        Ok(Self {
            from: message
                .from()
                .and_then(|f| f.first())
                .and_then(|a| a.address())
                .map(str::to_string),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            bcc: addresses(message.bcc()),
            reply_to: addresses(message.reply_to()),
            subject: message.subject().unwrap_or("").to_string(),
            text: message
                .body_text(0)
                .map(|b| b.to_string())
                .unwrap_or_default(),
            html,
            attachments,
            raw: raw.to_vec(),
        })
    }

    /// To, Cc and Bcc in that order
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// First `max_chars` characters of the text body followed by "..."
    pub fn excerpt(&self, max_chars: usize) -> String {
        let mut excerpt: String = self.text.chars().take(max_chars).collect();
        excerpt.push_str("...");
        excerpt
    }
}

fn addresses(address: Option<&Address>) -> Vec<String> {
    address
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
