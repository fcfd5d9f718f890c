//! Process-lifetime ledger used when no database is configured or it cannot be opened.
//!
//! Dedup holds only until the process exits.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::traits::{
    ChatIdentity, IdentityLink, NotificationKey, NotificationLedger, NotificationRecord,
    NotificationType, SnapshotStore, TaskSnapshot,
};

#[derive(Default)]
struct Ledger {
    keys: HashSet<String>,
    records: Vec<NotificationRecord>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    ledger: Mutex<Ledger>,
    snapshots: RwLock<HashMap<i64, TaskSnapshot>>,
    bot_tasks: RwLock<HashSet<i64>>,
    links: RwLock<HashMap<i64, (ChatIdentity, i64)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationLedger for MemoryStateStore {
    async fn notification_sent(&self, key: &NotificationKey) -> anyhow::Result<bool> {
        Ok(self.ledger.lock().await.keys.contains(&key.to_string()))
    }

    async fn try_mark_sent(
        &self,
        key: &NotificationKey,
        extra_data: Option<&str>,
    ) -> anyhow::Result<bool> {
        let rendered = key.to_string();
        let mut ledger = self.ledger.lock().await;
        if !ledger.keys.insert(rendered.clone()) {
            return Ok(false);
        }
        ledger.records.push(NotificationRecord {
            notification_key: rendered,
            task_id: key.task_id,
            notification_type: key.kind.as_str().to_string(),
            sent_at: chrono::Utc::now().to_rfc3339(),
            extra_data: extra_data.map(str::to_string),
        });
        Ok(true)
    }

    async fn clear_sent(&self, key: &NotificationKey) -> anyhow::Result<()> {
        let rendered = key.to_string();
        let mut ledger = self.ledger.lock().await;
        ledger.keys.remove(&rendered);
        ledger.records.retain(|r| r.notification_key != rendered);
        Ok(())
    }

    async fn notification_history(
        &self,
        task_id: Option<i64>,
        kind: Option<NotificationType>,
        limit: i64,
    ) -> anyhow::Result<Vec<NotificationRecord>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .records
            .iter()
            .rev()
            .filter(|r| task_id.map_or(true, |id| r.task_id == id))
            .filter(|r| kind.map_or(true, |k| r.notification_type == k.as_str()))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStateStore {
    async fn get_snapshot(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>> {
        Ok(self.snapshots.read().await.get(&task_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.task_id, snapshot.clone());
        Ok(())
    }

    async fn was_task_created_via_bot(&self, task_id: i64) -> anyhow::Result<bool> {
        Ok(self.bot_tasks.read().await.contains(&task_id))
    }

    async fn record_task_created_via_bot(
        &self,
        task_id: i64,
        _chat_id: Option<i64>,
    ) -> anyhow::Result<()> {
        self.bot_tasks.write().await.insert(task_id);
        Ok(())
    }
}

#[async_trait]
impl IdentityLink for MemoryStateStore {
    async fn chat_identity_for(&self, crm_user_id: i64) -> anyhow::Result<Option<ChatIdentity>> {
        let links = self.links.read().await;
        let mut matches: Vec<&ChatIdentity> = links
            .values()
            .filter(|(_, crm)| *crm == crm_user_id)
            .map(|(identity, _)| identity)
            .collect();
        matches.sort_by_key(|identity| identity.telegram_id);
        Ok(matches.first().map(|identity| (*identity).clone()))
    }

    async fn crm_user_for(&self, telegram_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self.links.read().await.get(&telegram_id).map(|(_, crm)| *crm))
    }

    async fn link(&self, identity: &ChatIdentity, crm_user_id: i64) -> anyhow::Result<()> {
        self.links
            .write()
            .await
            .insert(identity.telegram_id, (identity.clone(), crm_user_id));
        Ok(())
    }

    async fn unlink(&self, telegram_id: i64) -> anyhow::Result<bool> {
        Ok(self.links.write().await.remove(&telegram_id).is_some())
    }

    async fn all_links(&self) -> anyhow::Result<Vec<(ChatIdentity, i64)>> {
        let mut all: Vec<(ChatIdentity, i64)> = self.links.read().await.values().cloned().collect();
        all.sort_by_key(|(identity, _)| identity.telegram_id);
        Ok(all)
    }
}
