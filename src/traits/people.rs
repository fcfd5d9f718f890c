use async_trait::async_trait;

use super::ChatIdentity;

/// Mapping between chat users and CRM users.
///
/// Only users present here are ever notified.
#[async_trait]
pub trait IdentityLink: Send + Sync {
    /// Chat identity linked to a CRM user, if any.
    async fn chat_identity_for(&self, crm_user_id: i64) -> anyhow::Result<Option<ChatIdentity>>;

    /// CRM user linked to a chat user, if any.
    async fn crm_user_for(&self, telegram_id: i64) -> anyhow::Result<Option<i64>>;

    /// Create or replace the link for `identity.telegram_id`.
    async fn link(&self, identity: &ChatIdentity, crm_user_id: i64) -> anyhow::Result<()>;

    /// Remove a link. Returns whether one existed.
    async fn unlink(&self, telegram_id: i64) -> anyhow::Result<bool>;

    async fn all_links(&self) -> anyhow::Result<Vec<(ChatIdentity, i64)>>;
}
