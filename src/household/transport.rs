//! Outbound message delivery.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{info, warn};

/// A failed send. Callers log it and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The Bot API rejected the request or the network failed.
    Api(String),
    /// No answer within the send timeout.
    Timeout(Duration),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(e) => write!(f, "failed to send: {}", e),
            Self::Timeout(d) => write!(f, "send timed out after {:?}", d),
        }
    }
}

impl std::error::Error for TransportError {}

/// Something that can deliver text to a chat.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, chat_id: i64, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Send through `transport`, treating an expired timeout as a failure.
pub async fn deliver<T: Transport + ?Sized>(
    transport: &T,
    chat_id: i64,
    text: &str,
    timeout: Duration,
) -> Result<(), TransportError> {
    info!("Sending message to {}: {:?}", chat_id, text);
    let result = match tokio::time::timeout(timeout, transport.send(chat_id, text)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };
    if let Err(ref e) = result {
        warn!("Delivery to {} failed: {}", chat_id, e);
    }
    result
}

/// Telegram Bot API transport.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl Transport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Api(e.to_string()))
    }
}
