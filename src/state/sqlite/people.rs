use super::*;

fn identity_from_row(row: &sqlx::sqlite::SqliteRow) -> ChatIdentity {
    ChatIdentity {
        telegram_id: row.get("telegram_id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
    }
}

#[async_trait]
impl crate::traits::IdentityLink for SqliteStateStore {
    async fn chat_identity_for(&self, crm_user_id: i64) -> anyhow::Result<Option<ChatIdentity>> {
        // Several chat accounts may map to one CRM user; the most recent link wins.
        let row = sqlx::query(
            "SELECT telegram_id, username, display_name FROM telegram_to_bitrix
             WHERE bitrix_user_id = ?
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(crm_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(identity_from_row))
    }

    async fn crm_user_for(&self, telegram_id: i64) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT bitrix_user_id FROM telegram_to_bitrix WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("bitrix_user_id")))
    }

    async fn link(&self, identity: &ChatIdentity, crm_user_id: i64) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO telegram_to_bitrix (telegram_id, bitrix_user_id, username, display_name, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(telegram_id) DO UPDATE SET
                bitrix_user_id = excluded.bitrix_user_id,
                username = excluded.username,
                display_name = excluded.display_name,
                updated_at = excluded.updated_at",
        )
        .bind(identity.telegram_id)
        .bind(crm_user_id)
        .bind(&identity.username)
        .bind(&identity.display_name)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unlink(&self, telegram_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM telegram_to_bitrix WHERE telegram_id = ?")
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn all_links(&self) -> anyhow::Result<Vec<(ChatIdentity, i64)>> {
        let rows = sqlx::query(
            "SELECT telegram_id, bitrix_user_id, username, display_name FROM telegram_to_bitrix
             ORDER BY telegram_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (identity_from_row(row), row.get::<i64, _>("bitrix_user_id")))
            .collect())
    }
}
