use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ThreadId};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::traits::{ChatTransport, MemberHandle, SendError};

/// Outbound-only Telegram transport. The bot never polls for updates; it
/// just posts notifications into the configured group chat.
pub struct TelegramTransport {
    bot: Bot,
    bot_token: String,
}

impl Drop for TelegramTransport {
    fn drop(&mut self) {
        self.bot_token.zeroize();
    }
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
            bot_token: bot_token.to_string(),
        }
    }

    /// Confirm the token works and return the bot username.
    pub async fn verify(&self) -> anyhow::Result<String> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram getMe failed: {}", e))?;
        let username = me.username.clone().unwrap_or_default();
        info!(bot = %username, "Telegram bot verified");
        Ok(username)
    }
}

/// Map a Bot API error description onto the transport's error kinds.
fn classify_send_error(description: &str) -> SendError {
    if description.to_lowercase().contains("thread not found") {
        SendError::TopicNotFound(description.to_string())
    } else {
        SendError::Delivery(description.to_string())
    }
}

fn is_missing_member(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("user not found")
        || lower.contains("participant_id_invalid")
        || lower.contains("member not found")
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        html: &str,
        topic_id: Option<i32>,
    ) -> Result<i32, SendError> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), html)
            .parse_mode(ParseMode::Html);
        if let Some(topic) = topic_id {
            request = request.message_thread_id(ThreadId(MessageId(topic)));
        }
        match request.await {
            Ok(msg) => {
                debug!(chat_id, message_id = msg.id.0, "Telegram message sent");
                Ok(msg.id.0)
            }
            Err(e) => {
                let err = classify_send_error(&e.to_string());
                warn!(chat_id, ?topic_id, "Telegram send failed: {}", err);
                Err(err)
            }
        }
    }

    async fn resolve_display_handle(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> anyhow::Result<Option<MemberHandle>> {
        let Ok(uid) = u64::try_from(user_id) else {
            return Ok(None);
        };
        match self.bot.get_chat_member(ChatId(chat_id), UserId(uid)).await {
            Ok(member) if member.kind.is_present() => {
                let full_name = member.user.full_name();
                Ok(Some(MemberHandle {
                    username: member.user.username.clone(),
                    display_name: (!full_name.trim().is_empty()).then_some(full_name),
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if is_missing_member(&e.to_string()) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("getChatMember failed: {}", e)),
        }
    }
}
