//! Mirrors log events into a Telegram chat.
//!
//! WARN and ERROR from anywhere go out immediately. INFO is only forwarded for
//! the linking engine and is batched every few seconds.

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
/// Telegram rejects messages over 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

/// INFO is forwarded for the binary root and the linking engine.
fn forwards_info(target: &str) -> bool {
    target == "subbot" || target.starts_with("subbot::linking")
}

/// Log message with priority.
#[derive(Debug, PartialEq)]
enum LogMessage {
    /// WARN/ERROR - send immediately
    Urgent(String),
    /// INFO - batch and send periodically
    Info(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut info_buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(LogMessage::Urgent(text)) => {
                                // Keep ordering: pending INFO goes out first
                                flush_buffer(&bot, chat_id, &mut info_buffer).await;
                                send_log(&bot, chat_id, &text).await;
                            }
                            Some(LogMessage::Info(text)) => {
                                info_buffer.push(text);
                                if info_buffer.len() >= MAX_BATCH {
                                    flush_buffer(&bot, chat_id, &mut info_buffer).await;
                                }
                            }
                            None => {
                                flush_buffer(&bot, chat_id, &mut info_buffer).await;
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        flush_buffer(&bot, chat_id, &mut info_buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_MESSAGE_CHARS {
        let truncated: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    // eprintln, not tracing: a failed send must not feed back into this layer
    if let Err(e) = bot.send_message(chat_id, truncate(text)).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

async fn flush_buffer(bot: &Bot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(bot, chat_id, &combined).await;
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} ({})", self.message, self.fields.join(" "))
        }
    }
}

/// Decide whether and how an event is forwarded.
fn classify(level: Level, target: &str, text: String) -> Option<LogMessage> {
    match level {
        Level::ERROR => Some(LogMessage::Urgent(format!("❌ {text}"))),
        Level::WARN => Some(LogMessage::Urgent(format!("⚠️ {text}"))),
        Level::INFO if forwards_info(target) => Some(LogMessage::Info(text)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let Some(msg) = classify(level, metadata.target(), visitor.render()) else {
            return;
        };

        if self.tx.send(msg).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
