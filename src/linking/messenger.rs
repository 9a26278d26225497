//! Outbound chat surface of the host bot.

use async_trait::async_trait;

/// Sends notices to the chat a link request came from.
///
/// Callers treat every method as best-effort: errors are logged, never
/// propagated into the attempt state machine.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Returns the id of the sent message.
    async fn send_text(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<i64, String>;

    async fn send_image(
        &self,
        chat_id: i64,
        png: Vec<u8>,
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<i64, String>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), String>;
}
