//! Webhook-driven path: normalized CRM events in, deliveries out.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::composer::NotificationEvent;
use super::dispatch::DeliveryOutcome;
use super::{deadline, fields, Engine};
use crate::traits::{FieldBag, NotificationKey, NotificationType, TaskSnapshot};
use crate::utils::short_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    TaskAdd,
    TaskUpdate,
    TaskDelete,
    CommentAdd,
    CommentUpdate,
    CommentDelete,
}

impl EventName {
    pub fn parse(raw: &str) -> Option<Self> {
        let name = match raw.trim().to_ascii_uppercase().as_str() {
            "ONTASKADD" => EventName::TaskAdd,
            "ONTASKUPDATE" => EventName::TaskUpdate,
            "ONTASKDELETE" => EventName::TaskDelete,
            "ONTASKCOMMENTADD" => EventName::CommentAdd,
            "ONTASKCOMMENTUPDATE" => EventName::CommentUpdate,
            "ONTASKCOMMENTDELETE" => EventName::CommentDelete,
            _ => return None,
        };
        Some(name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::TaskAdd => "ONTASKADD",
            EventName::TaskUpdate => "ONTASKUPDATE",
            EventName::TaskDelete => "ONTASKDELETE",
            EventName::CommentAdd => "ONTASKCOMMENTADD",
            EventName::CommentUpdate => "ONTASKCOMMENTUPDATE",
            EventName::CommentDelete => "ONTASKCOMMENTDELETE",
        }
    }

    pub fn is_comment(&self) -> bool {
        matches!(
            self,
            EventName::CommentAdd | EventName::CommentUpdate | EventName::CommentDelete
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound CRM event after wire decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookEvent {
    pub event_name: String,
    pub task_fields: FieldBag,
    pub before_fields: Option<FieldBag>,
    pub after_fields: Option<FieldBag>,
    pub comment_fields: Option<FieldBag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownEvent,
    TaskCreated,
    MissingTaskId,
    NotCreatedViaBot,
    TaskNotFound,
    NoRecipients,
    SystemComment,
    CommentsDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Dropped(DropReason),
    Delivered(Vec<(NotificationType, DeliveryOutcome)>),
}

impl RouteOutcome {
    /// Number of messages actually sent.
    pub fn sent(&self) -> usize {
        match self {
            RouteOutcome::Dropped(_) => 0,
            RouteOutcome::Delivered(d) => d
                .iter()
                .filter(|(_, outcome)| *outcome == DeliveryOutcome::Sent)
                .count(),
        }
    }
}

/// Stable digest of a task's tracked state, used to tell replays from real updates.
pub fn state_fingerprint(snapshot: &TaskSnapshot) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        snapshot.title.trim(),
        snapshot.deadline.as_deref().map(deadline::normalize).unwrap_or_default(),
        snapshot.status.as_deref().unwrap_or_default().trim(),
        snapshot.responsible_id.unwrap_or_default(),
        snapshot.created_by_id.unwrap_or_default(),
        snapshot.changed_date.as_deref().unwrap_or_default().trim(),
    );
    short_hash(&material, 12)
}

pub struct EventRouter {
    engine: Arc<Engine>,
}

impl EventRouter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Process one event to completion.
    ///
    /// Errors are ledger failures only; upstream enrichment failures are
    /// logged and processing continues with the data at hand.
    pub async fn handle(&self, event: WebhookEvent) -> anyhow::Result<RouteOutcome> {
        let Some(name) = EventName::parse(&event.event_name) else {
            debug!(event = %event.event_name, "Ignoring unknown CRM event");
            return Ok(RouteOutcome::Dropped(DropReason::UnknownEvent));
        };
        match name {
            EventName::TaskAdd => {
                debug!("Task creation events are handled by the creating flow");
                Ok(RouteOutcome::Dropped(DropReason::TaskCreated))
            }
            EventName::TaskUpdate => self.on_task_update(name, &event).await,
            EventName::TaskDelete => self.on_task_delete(name, &event).await,
            EventName::CommentAdd | EventName::CommentUpdate | EventName::CommentDelete => {
                self.on_comment(name, &event).await
            }
        }
    }

    fn task_id_of(name: EventName, event: &WebhookEvent) -> Option<i64> {
        if name.is_comment() {
            event
                .comment_fields
                .as_ref()
                .and_then(|c| fields::nonzero_id(c, fields::TASK_ID_KEYS))
                .or_else(|| fields::nonzero_id(&event.task_fields, fields::TASK_ID_KEYS))
                .or_else(|| fields::nonzero_id(&event.task_fields, fields::ID_KEYS))
        } else {
            fields::nonzero_id(&event.task_fields, fields::ID_KEYS)
                .or_else(|| {
                    event
                        .after_fields
                        .as_ref()
                        .and_then(|b| fields::nonzero_id(b, fields::ID_KEYS))
                })
                .or_else(|| {
                    event
                        .before_fields
                        .as_ref()
                        .and_then(|b| fields::nonzero_id(b, fields::ID_KEYS))
                })
        }
    }

    /// Common gate: the event names a task and that task came through the bot.
    async fn admit(
        &self,
        name: EventName,
        event: &WebhookEvent,
    ) -> anyhow::Result<Result<i64, DropReason>> {
        let Some(task_id) = Self::task_id_of(name, event) else {
            warn!(event = %name, "CRM event without a task id");
            return Ok(Err(DropReason::MissingTaskId));
        };
        if !self.engine.store.was_task_created_via_bot(task_id).await? {
            debug!(task_id, event = %name, "Task not created via bot, ignoring");
            return Ok(Err(DropReason::NotCreatedViaBot));
        }
        Ok(Ok(task_id))
    }

    /// Best-available snapshot when the CRM cannot be asked.
    fn fallback_snapshot(
        task_id: i64,
        bag: Option<&FieldBag>,
        previous: Option<&TaskSnapshot>,
    ) -> TaskSnapshot {
        let from_event = bag
            .and_then(TaskSnapshot::from_fields)
            .filter(|s| s.task_id == task_id)
            .unwrap_or_else(|| TaskSnapshot {
                task_id,
                ..Default::default()
            });
        match previous {
            Some(prev) => from_event.merged_over(prev),
            None => from_event,
        }
    }

    async fn on_task_update(
        &self,
        name: EventName,
        event: &WebhookEvent,
    ) -> anyhow::Result<RouteOutcome> {
        let task_id = match self.admit(name, event).await? {
            Ok(id) => id,
            Err(reason) => return Ok(RouteOutcome::Dropped(reason)),
        };
        let engine = &self.engine;
        let previous = engine.store.get_snapshot(task_id).await?;

        let current = match engine.crm.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!(task_id, "Updated task no longer exists in CRM");
                return Ok(RouteOutcome::Dropped(DropReason::TaskNotFound));
            }
            Err(e) => {
                warn!(task_id, "Task refetch failed, using event payload: {}", e);
                let bag = event.after_fields.as_ref().or(Some(&event.task_fields));
                Self::fallback_snapshot(task_id, bag, previous.as_ref())
            }
        };

        let now = engine.now_local();
        let diff = engine.detector.detect(
            &current,
            previous.as_ref(),
            event.before_fields.as_ref(),
            event.after_fields.as_ref(),
            now,
        );
        let overdue_now = engine.is_overdue(&current, now);
        debug!(
            task_id,
            changes = ?diff.changes,
            overdue_now,
            "Detected task changes"
        );

        let recipients = engine
            .recipients(current.responsible_id, current.created_by_id, None)
            .await;

        let outcome = if recipients.is_empty() {
            debug!(task_id, "No linked recipients for task update");
            RouteOutcome::Dropped(DropReason::NoRecipients)
        } else {
            let task = engine.task_ref(&current);
            let mut deliveries = Vec::new();

            let overdue_key = current
                .deadline
                .as_deref()
                .map(|d| NotificationKey::new(task_id, NotificationType::Overdue, deadline::normalize(d)));
            let update_key = NotificationKey::new(
                task_id,
                NotificationType::TaskUpdated,
                format!("{}:{}", name, state_fingerprint(&current)),
            );

            let update = NotificationEvent::TaskUpdated { diff, overdue_now };
            if let Some(n) = engine.composer.compose(&update, &task, &recipients) {
                let companions: Vec<NotificationKey> = if n.reports_overdue {
                    overdue_key.iter().cloned().collect()
                } else {
                    Vec::new()
                };
                let result = engine.dispatcher.deliver(&n, &update_key, &companions).await;
                deliveries.push((NotificationType::TaskUpdated, result));
            }

            if let (true, Some(key)) = (overdue_now, overdue_key.as_ref()) {
                if !engine.store.notification_sent(key).await? {
                    if let Some(n) =
                        engine.composer.compose(&NotificationEvent::TaskOverdue, &task, &recipients)
                    {
                        let result = engine.dispatcher.deliver(&n, key, &[]).await;
                        deliveries.push((NotificationType::Overdue, result));
                    }
                }
            }
            RouteOutcome::Delivered(deliveries)
        };

        if let Err(e) = engine.store.save_snapshot(&current).await {
            error!(task_id, "Failed to persist task snapshot: {}", e);
        }
        Ok(outcome)
    }

    async fn on_task_delete(
        &self,
        name: EventName,
        event: &WebhookEvent,
    ) -> anyhow::Result<RouteOutcome> {
        let task_id = match self.admit(name, event).await? {
            Ok(id) => id,
            Err(reason) => return Ok(RouteOutcome::Dropped(reason)),
        };
        let engine = &self.engine;
        let previous = engine.store.get_snapshot(task_id).await?;
        let bag = if event.task_fields.is_empty() {
            event.before_fields.as_ref()
        } else {
            Some(&event.task_fields)
        };
        let task = Self::fallback_snapshot(task_id, bag, previous.as_ref());

        let recipients = engine
            .recipients(task.responsible_id, task.created_by_id, None)
            .await;
        let Some(n) = engine
            .composer
            .compose(&NotificationEvent::TaskDeleted, &engine.task_ref(&task), &recipients)
        else {
            debug!(task_id, "No linked recipients for task deletion");
            return Ok(RouteOutcome::Dropped(DropReason::NoRecipients));
        };
        let key = NotificationKey::new(task_id, NotificationType::TaskDeleted, name.as_str());
        let result = engine.dispatcher.deliver(&n, &key, &[]).await;
        Ok(RouteOutcome::Delivered(vec![(NotificationType::TaskDeleted, result)]))
    }

    async fn on_comment(
        &self,
        name: EventName,
        event: &WebhookEvent,
    ) -> anyhow::Result<RouteOutcome> {
        let engine = &self.engine;
        if !engine.settings.enable_comment_notifications {
            return Ok(RouteOutcome::Dropped(DropReason::CommentsDisabled));
        }
        let task_id = match self.admit(name, event).await? {
            Ok(id) => id,
            Err(reason) => return Ok(RouteOutcome::Dropped(reason)),
        };

        let comment_fields = event.comment_fields.clone().unwrap_or_default();
        let comment_id = fields::comment_id(&comment_fields);

        let task = match engine.crm.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id, "Commented task not found in CRM, using stored snapshot");
                let previous = engine.store.get_snapshot(task_id).await?;
                Self::fallback_snapshot(task_id, None, previous.as_ref())
            }
            Err(e) => {
                warn!(task_id, "Task lookup for comment failed: {}", e);
                let previous = engine.store.get_snapshot(task_id).await?;
                Self::fallback_snapshot(task_id, None, previous.as_ref())
            }
        };

        let mut text = fields::text(&comment_fields, fields::COMMENT_TEXT_KEYS);
        let mut author_id = fields::nonzero_id(&comment_fields, fields::COMMENT_AUTHOR_KEYS);
        if name != EventName::CommentDelete {
            if let Some(cid) = comment_id {
                match engine.crm.get_comment(task_id, cid).await {
                    Ok(Some(comment)) => {
                        if !comment.text.trim().is_empty() {
                            text = Some(comment.text);
                        }
                        author_id = comment.author_id.or(author_id);
                    }
                    Ok(None) => debug!(task_id, comment_id = cid, "Comment not found"),
                    Err(e) => warn!(task_id, comment_id = cid, "Comment fetch failed: {}", e),
                }
            }
        }

        if name == EventName::CommentAdd {
            if let Some(body) = text.as_deref() {
                if super::composer::is_system_creation_notice(body) {
                    debug!(task_id, "Skipping system task-creation comment");
                    return Ok(RouteOutcome::Dropped(DropReason::SystemComment));
                }
            }
        }

        let recipients = engine
            .recipients(task.responsible_id, task.created_by_id, author_id)
            .await;
        let (kind, composed) = match name {
            EventName::CommentAdd => (
                NotificationType::CommentAdded,
                NotificationEvent::CommentAdded { text: text.clone() },
            ),
            EventName::CommentUpdate => (NotificationType::CommentUpdated, NotificationEvent::CommentUpdated),
            _ => (NotificationType::CommentDeleted, NotificationEvent::CommentDeleted),
        };
        let Some(n) = engine
            .composer
            .compose(&composed, &engine.task_ref(&task), &recipients)
        else {
            debug!(task_id, "No linked recipients for comment event");
            return Ok(RouteOutcome::Dropped(DropReason::NoRecipients));
        };

        let comment_ref = match comment_id {
            Some(cid) => cid.to_string(),
            None => short_hash(&serde_json::Value::Object(comment_fields).to_string(), 12),
        };
        let disambiguator = match name {
            EventName::CommentUpdate => {
                format!("{}:{}", comment_ref, short_hash(text.as_deref().unwrap_or_default(), 8))
            }
            _ => comment_ref,
        };
        let key = NotificationKey::new(task_id, kind, disambiguator);
        let result = engine.dispatcher.deliver(&n, &key, &[]).await;
        Ok(RouteOutcome::Delivered(vec![(kind, result)]))
    }
}
