//! Bitrix24 REST client (inbound webhook token auth).

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::notifications::fields;
use crate::traits::{FieldBag, TaskComment, TaskDirectory, TaskSnapshot};

const TASK_SELECT: &[&str] = &[
    "ID",
    "TITLE",
    "DEADLINE",
    "STATUS",
    "RESPONSIBLE_ID",
    "CREATED_BY",
    "CHANGED_DATE",
];
const FILTER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Upper bound on list pagination, in pages of 50.
const MAX_PAGES: usize = 200;

pub struct BitrixClient {
    client: Client,
    portal_url: String,
    webhook_token: String,
}

impl Drop for BitrixClient {
    fn drop(&mut self) {
        self.webhook_token.zeroize();
    }
}

/// Turn a configured portal domain into a base URL.
///
/// A bare domain gets `https://`. An explicit `http://` is accepted only for
/// localhost, since the webhook token travels in the URL path.
fn portal_base_url(domain: &str) -> Result<String, String> {
    let domain = domain.trim().trim_end_matches('/');
    if domain.is_empty() {
        return Err("Bitrix24 domain is empty".to_string());
    }
    let candidate = if domain.contains("://") {
        domain.to_string()
    } else {
        format!("https://{}", domain)
    };
    let parsed = url::Url::parse(&candidate)
        .map_err(|e| format!("Invalid Bitrix24 domain '{}': {}", domain, e))?;
    let host = parsed.host_str().unwrap_or("");
    if host.is_empty() {
        return Err(format!("Bitrix24 domain '{}' has no host", domain));
    }
    match parsed.scheme() {
        "https" => Ok(candidate),
        "http" if host == "localhost" || host == "127.0.0.1" => Ok(candidate),
        "http" => Err(format!(
            "HTTP is not allowed for remote Bitrix24 portals ('{}'). Use HTTPS.",
            domain
        )),
        other => Err(format!("Unsupported URL scheme '{}' in '{}'", other, domain)),
    }
}

fn exclude_status_filter(filter: &mut Value, exclude_statuses: &[String]) {
    if !exclude_statuses.is_empty() {
        filter["!STATUS"] = json!(exclude_statuses);
    }
}

fn overdue_filter(now: NaiveDateTime, exclude_statuses: &[String]) -> Value {
    let mut filter = json!({ "<DEADLINE": now.format(FILTER_TIME_FORMAT).to_string() });
    exclude_status_filter(&mut filter, exclude_statuses);
    filter
}

fn window_filter(start: NaiveDateTime, end: NaiveDateTime, exclude_statuses: &[String]) -> Value {
    let mut filter = json!({
        ">=DEADLINE": start.format(FILTER_TIME_FORMAT).to_string(),
        "<=DEADLINE": end.format(FILTER_TIME_FORMAT).to_string(),
    });
    exclude_status_filter(&mut filter, exclude_statuses);
    filter
}

/// Tasks on one `tasks.task.list` page plus the offset of the next page.
fn parse_task_page(data: &Value) -> (Vec<TaskSnapshot>, Option<u64>) {
    let tasks = data["result"]["tasks"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(TaskSnapshot::from_fields)
                .collect()
        })
        .unwrap_or_default();
    (tasks, data["next"].as_u64())
}

fn parse_comment(result: &FieldBag, comment_id: i64) -> TaskComment {
    TaskComment {
        id: fields::nonzero_id(result, &["ID", "id"]).unwrap_or(comment_id),
        author_id: fields::nonzero_id(result, fields::COMMENT_AUTHOR_KEYS),
        text: fields::text(result, fields::COMMENT_TEXT_KEYS).unwrap_or_default(),
        posted_at: fields::text(result, fields::COMMENT_DATE_KEYS),
    }
}

/// Classified failure of a REST call.
#[derive(Debug, thiserror::Error)]
pub enum BitrixError {
    #[error("Bitrix24 request failed: {0}")]
    Transport(String),
    /// The portal answered with an `error`/`error_description` body.
    #[error("Bitrix24 {method} error {code}: {description}")]
    Api {
        method: String,
        code: String,
        description: String,
    },
    #[error("Bitrix24 {method} returned {status}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },
    #[error("Bitrix24 {method} returned a non-JSON body")]
    Malformed { method: String },
}

/// True only when the portal itself reports that the requested item is gone.
/// Method, URL and transport failures are never a missing item.
fn is_missing_item(err: &anyhow::Error) -> bool {
    let Some(BitrixError::Api {
        code, description, ..
    }) = err.downcast_ref::<BitrixError>()
    else {
        return false;
    };
    if code.eq_ignore_ascii_case("ERROR_METHOD_NOT_FOUND") {
        return false;
    }
    let description = description.to_lowercase();
    [
        "task not found",
        "comment not found",
        "item_not_found",
        "задача не найдена",
        "комментарий не найден",
    ]
    .iter()
    .any(|marker| description.contains(marker))
}

impl BitrixClient {
    pub fn new(domain: &str, webhook_token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let portal_url = portal_base_url(domain).map_err(|e| anyhow::anyhow!(e))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            portal_url,
            webhook_token: webhook_token.trim().to_string(),
        })
    }

    /// Call a REST method and return the decoded response body.
    pub async fn call(&self, method: &str, params: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/rest/{}/{}", self.portal_url, self.webhook_token, method);
        debug!(method, "Calling Bitrix24 REST");

        let resp = match self.client.post(&url).json(params).send().await {
            Ok(r) => r,
            Err(e) => {
                // The URL carries the webhook token.
                let e = e.without_url();
                error!(method, "Bitrix24 request failed: {}", e);
                return Err(BitrixError::Transport(e.to_string()).into());
            }
        };

        let status = resp.status();
        let text = resp.text().await?;
        let data: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if let Some(code) = data.get("error").and_then(Value::as_str) {
            return Err(BitrixError::Api {
                method: method.to_string(),
                code: code.to_string(),
                description: data["error_description"].as_str().unwrap_or("").to_string(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(BitrixError::Http {
                method: method.to_string(),
                status: status.as_u16(),
                body: crate::utils::truncate_str(&text, 200),
            }
            .into());
        }
        if data.is_null() {
            return Err(BitrixError::Malformed {
                method: method.to_string(),
            }
            .into());
        }
        Ok(data)
    }

    async fn list_tasks(&self, filter: Value) -> anyhow::Result<Vec<TaskSnapshot>> {
        let mut tasks = Vec::new();
        let mut start: u64 = 0;
        for _ in 0..MAX_PAGES {
            let data = self
                .call(
                    "tasks.task.list",
                    &json!({ "filter": filter, "select": TASK_SELECT, "start": start }),
                )
                .await?;
            let (page, next) = parse_task_page(&data);
            tasks.extend(page);
            match next {
                Some(n) if n > start => start = n,
                _ => return Ok(tasks),
            }
        }
        warn!(count = tasks.len(), "Task list pagination limit reached");
        Ok(tasks)
    }
}

#[async_trait]
impl TaskDirectory for BitrixClient {
    async fn get_task(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>> {
        let data = match self
            .call("tasks.task.get", &json!({ "taskId": task_id, "select": TASK_SELECT }))
            .await
        {
            Ok(data) => data,
            Err(e) if is_missing_item(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(data["result"]["task"]
            .as_object()
            .and_then(TaskSnapshot::from_fields))
    }

    async fn list_overdue_tasks(
        &self,
        now: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>> {
        let tasks = self.list_tasks(overdue_filter(now, exclude_statuses)).await?;
        info!(count = tasks.len(), "Fetched overdue tasks");
        Ok(tasks)
    }

    async fn list_tasks_with_deadline_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>> {
        let tasks = self
            .list_tasks(window_filter(start, end, exclude_statuses))
            .await?;
        info!(count = tasks.len(), "Fetched tasks with approaching deadlines");
        Ok(tasks)
    }

    async fn get_comment(
        &self,
        task_id: i64,
        comment_id: i64,
    ) -> anyhow::Result<Option<TaskComment>> {
        // The method accepts either named or positional parameters depending
        // on portal version; the first encoding that answers wins.
        let attempts = [
            json!({ "TASKID": task_id, "ITEMID": comment_id }),
            json!([task_id, comment_id]),
        ];
        let mut last_err = None;
        for params in &attempts {
            match self.call("task.commentitem.get", params).await {
                Ok(data) => {
                    return Ok(data["result"]
                        .as_object()
                        .map(|result| parse_comment(result, comment_id)));
                }
                Err(e) => {
                    debug!(task_id, comment_id, "task.commentitem.get attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if is_missing_item(&e) => Ok(None),
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn task_url(&self, task_id: i64, viewer_id: Option<i64>) -> String {
        format!(
            "{}/company/personal/user/{}/tasks/task/view/{}/",
            self.portal_url,
            viewer_id.unwrap_or(0),
            task_id
        )
    }
}
