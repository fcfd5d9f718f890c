use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::{TaskComment, TaskSnapshot};

/// Read access to the CRM's tasks and comments.
///
/// Times passed in are wall-clock values in the bot's home timezone, which is
/// the form the CRM filters expect.
#[async_trait]
pub trait TaskDirectory: Send + Sync {
    /// Fetch the authoritative current state of a task. `Ok(None)` if it does not exist.
    async fn get_task(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>>;

    /// Tasks whose deadline is before `now` and whose status is not in `exclude_statuses`.
    async fn list_overdue_tasks(
        &self,
        now: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>>;

    /// Tasks whose deadline falls within `[start, end]`, excluding the given statuses.
    async fn list_tasks_with_deadline_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>>;

    /// Fetch one comment of a task.
    async fn get_comment(&self, task_id: i64, comment_id: i64)
        -> anyhow::Result<Option<TaskComment>>;

    /// Browser link to the task, personalised for `viewer_id` when known.
    fn task_url(&self, task_id: i64, viewer_id: Option<i64>) -> String;
}
