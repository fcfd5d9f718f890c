use async_trait::async_trait;

use super::{IdentityLink, NotificationKey, NotificationRecord, NotificationType, TaskSnapshot};

/// Dedup records for sent notifications.
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    /// Whether a send was already recorded for `key`.
    async fn notification_sent(&self, key: &NotificationKey) -> anyhow::Result<bool>;

    /// Record `key` as sent if and only if it is not recorded yet.
    ///
    /// This is a single conditional insert: of several concurrent callers with the
    /// same key, exactly one gets `true`.
    async fn try_mark_sent(
        &self,
        key: &NotificationKey,
        extra_data: Option<&str>,
    ) -> anyhow::Result<bool>;

    /// Forget a recorded key so a later attempt may send again.
    async fn clear_sent(&self, key: &NotificationKey) -> anyhow::Result<()>;

    /// Most recent records first.
    async fn notification_history(
        &self,
        task_id: Option<i64>,
        kind: Option<NotificationType>,
        limit: i64,
    ) -> anyhow::Result<Vec<NotificationRecord>>;
}

/// Last-known task state and task provenance.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>>;

    /// Replace the stored snapshot for `snapshot.task_id` (last write wins).
    async fn save_snapshot(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()>;

    async fn was_task_created_via_bot(&self, task_id: i64) -> anyhow::Result<bool>;

    async fn record_task_created_via_bot(
        &self,
        task_id: i64,
        chat_id: Option<i64>,
    ) -> anyhow::Result<()>;
}

/// Everything the notification engine persists.
pub trait StateStore: Send + Sync + NotificationLedger + SnapshotStore + IdentityLink {}

impl<T> StateStore for T where T: Send + Sync + NotificationLedger + SnapshotStore + IdentityLink {}
