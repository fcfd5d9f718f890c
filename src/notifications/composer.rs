//! Turning detected changes and scan findings into chat messages.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use super::detector::DiffResult;
use crate::traits::{ChatIdentity, ChatTransport, IdentityLink, NotificationType, TaskSnapshot};
use crate::utils::{html_escape, squash_whitespace, truncate_str};

const COMMENT_PREVIEW_CHARS: usize = 100;
const UNTITLED: &str = "Без названия";
const MENTION_PLACEHOLDER: &str = "Пользователь";

/// The CRM's own "<actor> created [URL=..]task[/URL]" comment posted on task creation.
static SYSTEM_CREATION_NOTICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)созда(?:л|ла|ло)?\s+\[url=[^\]]*\]\s*задачу\s*\[/url\]")
        .expect("creation notice regex must compile")
});
static USER_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\[user=[^\]]*\](.*?)\[/user\]").expect("user tag regex must compile")
});
static URL_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\[url(?:=[^\]]*)?\](.*?)\[/url\]").expect("url tag regex must compile")
});
static TIMESTAMP_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(?:timestamp|date)=(\d{1,12})[^\]]*\]").expect("timestamp tag regex must compile")
});
static ANY_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[/?[A-Za-z*][^\]]*\]").expect("bbcode tag regex must compile"));

/// What happened, as far as the composer is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Periodic scan found the deadline passed.
    ScanOverdue,
    /// Periodic scan found the deadline within the warning window.
    ScanDeadlineApproaching { hours_left: i64 },
    /// Webhook update with its diff; `overdue_now` is the current task's state.
    TaskUpdated { diff: DiffResult, overdue_now: bool },
    /// Separate overdue alert raised from a webhook update.
    TaskOverdue,
    TaskDeleted,
    /// `text` is the raw comment body when it could be fetched.
    CommentAdded { text: Option<String> },
    CommentUpdated,
    CommentDeleted,
}

impl NotificationEvent {
    pub fn kind(&self) -> NotificationType {
        match self {
            NotificationEvent::ScanOverdue | NotificationEvent::TaskOverdue => {
                NotificationType::Overdue
            }
            NotificationEvent::ScanDeadlineApproaching { .. } => NotificationType::DeadlineWarning,
            NotificationEvent::TaskUpdated { .. } => NotificationType::TaskUpdated,
            NotificationEvent::TaskDeleted => NotificationType::TaskDeleted,
            NotificationEvent::CommentAdded { .. } => NotificationType::CommentAdded,
            NotificationEvent::CommentUpdated => NotificationType::CommentUpdated,
            NotificationEvent::CommentDeleted => NotificationType::CommentDeleted,
        }
    }
}

/// The task fields a message needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: i64,
    pub title: String,
    pub responsible_id: Option<i64>,
    pub created_by_id: Option<i64>,
    pub url: String,
}

impl TaskRef {
    pub fn from_snapshot(snapshot: &TaskSnapshot, url: String) -> Self {
        Self {
            task_id: snapshot.task_id,
            title: snapshot.title.clone(),
            responsible_id: snapshot.responsible_id,
            created_by_id: snapshot.created_by_id,
            url,
        }
    }

    fn display_title(&self) -> &str {
        let title = self.title.trim();
        if title.is_empty() {
            UNTITLED
        } else {
            title
        }
    }
}

/// Linked chat users involved in a task, by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub responsible: Option<ChatIdentity>,
    pub creator: Option<ChatIdentity>,
    pub author: Option<ChatIdentity>,
}

impl Recipients {
    /// Look up each CRM user independently. Lookup failures count as "not linked".
    pub async fn resolve<L: IdentityLink + ?Sized>(
        links: &L,
        responsible_id: Option<i64>,
        created_by_id: Option<i64>,
        author_id: Option<i64>,
    ) -> Self {
        Self {
            responsible: lookup(links, responsible_id).await,
            creator: lookup(links, created_by_id).await,
            author: lookup(links, author_id).await,
        }
    }

    /// Fill in chat handles for identities that have none stored.
    pub async fn enrich(&mut self, transport: &dyn ChatTransport, chat_id: i64) {
        for identity in [&mut self.responsible, &mut self.creator, &mut self.author]
            .into_iter()
            .flatten()
        {
            if identity.username.is_some() || identity.display_name.is_some() {
                continue;
            }
            match transport
                .resolve_display_handle(chat_id, identity.telegram_id)
                .await
            {
                Ok(Some(handle)) => {
                    identity.username = handle.username.filter(|u| !u.trim().is_empty());
                    identity.display_name = handle.display_name;
                }
                Ok(None) => {}
                Err(e) => debug!(
                    telegram_id = identity.telegram_id,
                    "Chat member lookup failed: {}", e
                ),
            }
        }
    }

    /// Distinct identities in responsible, creator, author order.
    pub fn unique(&self) -> Vec<&ChatIdentity> {
        let mut out: Vec<&ChatIdentity> = Vec::new();
        for identity in [&self.responsible, &self.creator, &self.author]
            .into_iter()
            .flatten()
        {
            if !out.iter().any(|seen| seen.telegram_id == identity.telegram_id) {
                out.push(identity);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.unique().is_empty()
    }

    /// Creator and responsible are both linked and are different people.
    fn creator_watches_responsible(&self) -> bool {
        match (&self.responsible, &self.creator) {
            (Some(r), Some(c)) => r.telegram_id != c.telegram_id,
            _ => false,
        }
    }
}

async fn lookup<L: IdentityLink + ?Sized>(links: &L, crm_user_id: Option<i64>) -> Option<ChatIdentity> {
    let id = crm_user_id.filter(|id| *id != 0)?;
    match links.chat_identity_for(id).await {
        Ok(found) => found,
        Err(e) => {
            debug!(crm_user_id = id, "Identity lookup failed: {}", e);
            None
        }
    }
}

/// Render a chat mention, preferring the public handle.
pub fn mention(identity: &ChatIdentity) -> String {
    if let Some(username) = identity.username.as_deref().filter(|u| !u.is_empty()) {
        return format!("@{}", html_escape(username));
    }
    let name = identity
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(MENTION_PLACEHOLDER);
    format!(
        "<a href='tg://user?id={}'>{}</a>",
        identity.telegram_id,
        html_escape(name)
    )
}

/// A composed message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub task_id: i64,
    pub kind: NotificationType,
    /// Plain-text body without mentions, for logs and the ledger.
    pub text: String,
    /// Full Telegram HTML: mentions, body, linked title.
    pub html: String,
    pub recipient_ids: Vec<i64>,
    /// The message itself tells the reader the deadline has passed.
    pub reports_overdue: bool,
}

pub fn is_system_creation_notice(text: &str) -> bool {
    SYSTEM_CREATION_NOTICE_RE.is_match(text)
}

/// Two renderings of the same body: plain and Telegram HTML.
struct Style<'a> {
    title: String,
    escape: &'a dyn Fn(&str) -> String,
}

pub struct NotificationComposer {
    tz: Tz,
}

impl NotificationComposer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Strip CRM markup from a comment body and collapse whitespace.
    pub fn clean_comment_text(&self, raw: &str) -> String {
        let text = USER_TAG_RE.replace_all(raw, "$1");
        let text = URL_TAG_RE.replace_all(&text, "$1");
        let text = TIMESTAMP_TAG_RE.replace_all(&text, |caps: &Captures| {
            caps[1]
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|dt| dt.with_timezone(&self.tz).format("%d.%m.%Y %H:%M").to_string())
                .unwrap_or_default()
        });
        let text = ANY_TAG_RE.replace_all(&text, "");
        squash_whitespace(&text)
    }

    /// Compose the message for `event`, or `None` when nothing should be sent.
    pub fn compose(
        &self,
        event: &NotificationEvent,
        task: &TaskRef,
        recipients: &Recipients,
    ) -> Option<Notification> {
        let kind = event.kind();
        let to = recipients.unique();
        if to.is_empty() {
            return None;
        }
        if let NotificationEvent::CommentAdded { text: Some(raw) } = event {
            if is_system_creation_notice(raw) {
                return None;
            }
        }

        let title = task.display_title();
        let plain = Style {
            title: format!("«{title}»"),
            escape: &|s: &str| s.to_string(),
        };
        let linked_title = if task.url.is_empty() || matches!(event, NotificationEvent::TaskDeleted) {
            format!("«{}»", html_escape(title))
        } else {
            format!("<a href='{}'>«{}»</a>", task.url, html_escape(title))
        };
        let html = Style {
            title: linked_title,
            escape: &html_escape,
        };

        let (text, reports_overdue) = self.body(event, recipients, &plain);
        let (html_body, _) = self.body(event, recipients, &html);

        let html = if matches!(event, NotificationEvent::TaskDeleted) {
            html_body
        } else {
            let mentions: Vec<String> = to.iter().map(|id| mention(id)).collect();
            format!("{}, {}", mentions.join(", "), html_body)
        };

        Some(Notification {
            task_id: task.task_id,
            kind,
            text,
            html,
            recipient_ids: to.iter().map(|id| id.telegram_id).collect(),
            reports_overdue,
        })
    }

    fn body(&self, event: &NotificationEvent, recipients: &Recipients, style: &Style) -> (String, bool) {
        let t = &style.title;
        let (subject, verb_overdue, verb_almost) = if recipients.creator_watches_responsible() {
            ("исполнитель", "просрочил", "почти просрочил")
        } else {
            ("вы", "просрочили", "почти просрочили")
        };
        match event {
            NotificationEvent::ScanOverdue => (format!("{subject} {verb_overdue} задачу {t}"), true),
            NotificationEvent::ScanDeadlineApproaching { hours_left } => (
                format!("{subject} {verb_almost} задачу {t}: до дедлайна {hours_left} ч."),
                false,
            ),
            NotificationEvent::TaskUpdated { diff, overdue_now } => {
                if !diff.is_empty() {
                    let changes: Vec<String> = diff.changes.iter().map(|c| (style.escape)(c)).collect();
                    let marker = if diff.deadline_overdue || *overdue_now { "⚠️ " } else { "" };
                    (
                        format!("{marker}задача {t}: {}", changes.join(", ")),
                        diff.deadline_overdue,
                    )
                } else if *overdue_now {
                    (format!("⚠️ задача {t}: дедлайн просрочен"), true)
                } else {
                    (format!("задача {t} обновлена"), false)
                }
            }
            NotificationEvent::TaskOverdue => (format!("⚠️ задача {t}: дедлайн просрочен"), true),
            NotificationEvent::TaskDeleted => (format!("задача {t} удалена"), false),
            NotificationEvent::CommentAdded { text } => {
                let preview = text
                    .as_deref()
                    .map(|raw| self.clean_comment_text(raw))
                    .filter(|cleaned| !cleaned.is_empty())
                    .map(|cleaned| truncate_str(&cleaned, COMMENT_PREVIEW_CHARS));
                match preview {
                    Some(p) => (format!("в задаче {t} новый комментарий: {}", (style.escape)(&p)), false),
                    None => (format!("в задаче {t} новый комментарий"), false),
                }
            }
            NotificationEvent::CommentUpdated => (format!("в задаче {t} обновлен комментарий"), false),
            NotificationEvent::CommentDeleted => (format!("в задаче {t} удален комментарий"), false),
        }
    }
}
