use std::time::Duration;

use async_trait::async_trait;

/// Why a chat delivery failed.
///
/// `TopicNotFound` is the one condition callers are expected to recover from,
/// by resending without the topic qualifier.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message thread not found: {0}")]
    TopicNotFound(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Public-facing details of a chat member, used to render mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberHandle {
    pub username: Option<String>,
    pub display_name: Option<String>,
}

/// Outbound chat transport (Telegram in production).
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send an HTML message to `chat_id`, optionally inside a forum topic.
    /// Returns the id of the delivered message.
    async fn send_message(
        &self,
        chat_id: i64,
        html: &str,
        topic_id: Option<i32>,
    ) -> Result<i32, SendError>;

    /// Look up how a user appears in `chat_id`. `Ok(None)` when the user is not a member.
    async fn resolve_display_handle(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> anyhow::Result<Option<MemberHandle>>;
}
