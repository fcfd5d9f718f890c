use super::*;

#[async_trait]
impl crate::traits::SnapshotStore for SqliteStateStore {
    async fn get_snapshot(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>> {
        let row = sqlx::query(
            "SELECT task_id, title, deadline, status, responsible_id, created_by_id, changed_date
             FROM task_states WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TaskSnapshot {
            task_id: row.get("task_id"),
            title: row.get("title"),
            deadline: row.get("deadline"),
            status: row.get("status"),
            responsible_id: row.get("responsible_id"),
            created_by_id: row.get("created_by_id"),
            changed_date: row.get("changed_date"),
        }))
    }

    async fn save_snapshot(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        let state_json = serde_json::to_string(snapshot)?;
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO task_states (task_id, title, deadline, status, responsible_id, created_by_id, changed_date, state_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                title = excluded.title,
                deadline = excluded.deadline,
                status = excluded.status,
                responsible_id = excluded.responsible_id,
                created_by_id = excluded.created_by_id,
                changed_date = excluded.changed_date,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
        )
        .bind(snapshot.task_id)
        .bind(&snapshot.title)
        .bind(&snapshot.deadline)
        .bind(&snapshot.status)
        .bind(snapshot.responsible_id)
        .bind(snapshot.created_by_id)
        .bind(&snapshot.changed_date)
        .bind(&state_json)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn was_task_created_via_bot(&self, task_id: i64) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM bot_created_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_task_created_via_bot(
        &self,
        task_id: i64,
        chat_id: Option<i64>,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO bot_created_tasks (task_id, chat_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(task_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(chat_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
