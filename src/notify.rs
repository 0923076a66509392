use crate::errors::AppResult;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

/// Messaging collaborator. Delivery failures are the sink's to report and
/// the caller's to log; a failed delivery never unwinds the schedule that
/// produced it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, channel: Channel, recipient: &str, message: &str) -> AppResult<()>;
}

/// Reference sink that writes deliveries to the log, for environments
/// without a real email or SMS provider wired in.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, channel: Channel, recipient: &str, message: &str) -> AppResult<()> {
        tracing::info!(
            channel = channel.as_str(),
            recipient,
            message,
            "notification delivered"
        );
        Ok(())
    }
}
