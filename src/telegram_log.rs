//! Tracing layer that mirrors log output into a Telegram chat.
//!
//! Warnings and errors go out immediately. Info lines are collected and
//! flushed as one message every few seconds. Sends from this layer never
//! go through `tracing` themselves.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;
/// Telegram rejects messages above 4096 characters.
const MAX_CHARS: usize = 4000;

enum LogLine {
    Urgent(String),
    Batched(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<LogLine>();
        tokio::spawn(forward(bot, chat_id, rx));
        Self { tx }
    }
}

async fn forward(bot: Bot, chat_id: ChatId, mut rx: mpsc::UnboundedReceiver<LogLine>) {
    let mut batch: Vec<String> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(LogLine::Urgent(text)) => post(&bot, chat_id, &text).await,
                Some(LogLine::Batched(text)) => {
                    batch.push(text);
                    if batch.len() >= MAX_BATCH {
                        flush(&bot, chat_id, &mut batch).await;
                    }
                }
                None => {
                    flush(&bot, chat_id, &mut batch).await;
                    break;
                }
            },
            _ = interval.tick() => flush(&bot, chat_id, &mut batch).await,
        }
    }
}

async fn flush(bot: &Bot, chat_id: ChatId, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    post(bot, chat_id, &combined).await;
}

async fn post(bot: &Bot, chat_id: ChatId, text: &str) {
    if let Err(e) = bot.send_message(chat_id, truncate(text)).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_CHARS).collect();
    format!("{}...", cut)
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.line = format!("{:?}{}", value, self.line);
        } else {
            self.line.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Render an event for the chat, or `None` for levels below INFO.
fn render(level: Level, line: String) -> Option<LogLine> {
    match level {
        Level::ERROR => Some(LogLine::Urgent(format!("❌ {}", line))),
        Level::WARN => Some(LogLine::Urgent(format!("⚠️ {}", line))),
        Level::INFO => Some(LogLine::Batched(line)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        if let Some(line) = render(level, visitor.line) {
            if self.tx.send(line).is_err() {
                eprintln!("Log channel closed, message dropped");
            }
        }
    }
}
