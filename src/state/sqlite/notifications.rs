use super::*;

#[async_trait]
impl crate::traits::NotificationLedger for SqliteStateStore {
    async fn notification_sent(&self, key: &NotificationKey) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM task_notifications WHERE notification_key = ? LIMIT 1")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn try_mark_sent(
        &self,
        key: &NotificationKey,
        extra_data: Option<&str>,
    ) -> anyhow::Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO task_notifications (notification_key, task_id, notification_type, sent_at, extra_data)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(notification_key) DO NOTHING",
        )
        .bind(key.to_string())
        .bind(key.task_id)
        .bind(key.kind.as_str())
        .bind(&now)
        .bind(extra_data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_sent(&self, key: &NotificationKey) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM task_notifications WHERE notification_key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn notification_history(
        &self,
        task_id: Option<i64>,
        kind: Option<crate::traits::NotificationType>,
        limit: i64,
    ) -> anyhow::Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            "SELECT notification_key, task_id, notification_type, sent_at, extra_data
             FROM task_notifications
             WHERE (?1 IS NULL OR task_id = ?1)
               AND (?2 IS NULL OR notification_type = ?2)
             ORDER BY sent_at DESC, id DESC
             LIMIT ?3",
        )
        .bind(task_id)
        .bind(kind.map(|k| k.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(NotificationRecord {
                notification_key: row.get("notification_key"),
                task_id: row.get("task_id"),
                notification_type: row.get("notification_type"),
                sent_at: row.get("sent_at"),
                extra_data: row.get("extra_data"),
            });
        }
        Ok(records)
    }
}
