use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod channels;
mod crm;
mod people;
mod state_store;

pub use channels::{ChatTransport, MemberHandle, SendError};
pub use crm::TaskDirectory;
pub use people::IdentityLink;
pub use state_store::{NotificationLedger, SnapshotStore, StateStore};

/// Loosely-typed field bag as delivered by the CRM (REST responses and webhook payloads).
pub type FieldBag = serde_json::Map<String, serde_json::Value>;

/// Notification-relevant fields of one CRM task at a point in time.
///
/// `deadline` keeps the upstream text verbatim; it is interpreted in the bot's
/// home timezone by [`crate::notifications::deadline`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<i64>,
    /// Upstream "last changed" stamp, when the CRM reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<String>,
}

/// A comment attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskComment {
    pub id: i64,
    pub author_id: Option<i64>,
    pub text: String,
    pub posted_at: Option<String>,
}

/// A chat-platform user that has been linked to a CRM user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub telegram_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ChatIdentity {
    pub fn new(telegram_id: i64) -> Self {
        Self {
            telegram_id,
            username: None,
            display_name: None,
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        let trimmed = username.trim().trim_start_matches('@');
        self.username = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }
}

/// Kinds of notification the engine can emit. Each one is an independent dedup axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Overdue,
    DeadlineWarning,
    TaskUpdated,
    TaskDeleted,
    CommentAdded,
    CommentUpdated,
    CommentDeleted,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Overdue => "overdue",
            NotificationType::DeadlineWarning => "deadline_warning",
            NotificationType::TaskUpdated => "task_updated",
            NotificationType::TaskDeleted => "task_deleted",
            NotificationType::CommentAdded => "comment_added",
            NotificationType::CommentUpdated => "comment_updated",
            NotificationType::CommentDeleted => "comment_deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw.trim() {
            "overdue" => NotificationType::Overdue,
            "deadline_warning" => NotificationType::DeadlineWarning,
            "task_updated" => NotificationType::TaskUpdated,
            "task_deleted" => NotificationType::TaskDeleted,
            "comment_added" => NotificationType::CommentAdded,
            "comment_updated" => NotificationType::CommentUpdated,
            "comment_deleted" => NotificationType::CommentDeleted,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite dedup key `(task_id, type, disambiguator)`.
///
/// Rendered as `"{task_id}_{type}_{disambiguator}"`, which is the form persisted
/// in the ledger. At most one successful send may ever exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub task_id: i64,
    pub kind: NotificationType,
    pub disambiguator: String,
}

impl NotificationKey {
    pub fn new(task_id: i64, kind: NotificationType, disambiguator: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            disambiguator: disambiguator.into(),
        }
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.task_id, self.kind, self.disambiguator)
    }
}

/// A persisted dedup/audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notification_key: String,
    pub task_id: i64,
    pub notification_type: String,
    pub sent_at: String,
    pub extra_data: Option<String>,
}

/// Source of "now". Injected so scans and diffs can be tested against fixed instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
