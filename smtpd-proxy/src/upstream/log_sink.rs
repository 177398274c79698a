//! `log-sink` upstream: records a summary of each message and discards it

use async_trait::async_trait;
use tracing::info;

use super::{Forward, ForwardContext};
use crate::envelope::Envelope;
use crate::error::ForwardError;

/// Characters of the text body included in the log record
const EXCERPT_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl Forward for LogSink {
    async fn forward(
        &self,
        ctx: &ForwardContext,
        envelope: &Envelope,
    ) -> Result<(), ForwardError> {
        info!(
            uid = %ctx.uid(),
            from = envelope.from.as_deref().unwrap_or(""),
            to = ?envelope.to,
            reply_to = ?envelope.reply_to,
            cc = ?envelope.cc,
            bcc = ?envelope.bcc,
            subject = %envelope.subject,
            text = %envelope.excerpt(EXCERPT_CHARS),
            "message received"
        );
        Ok(())
    }
}
