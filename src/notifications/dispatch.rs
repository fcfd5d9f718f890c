//! Claim-then-send delivery against the ledger.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use super::composer::Notification;
use crate::traits::{ChatTransport, NotificationKey, SendError, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// The key was already claimed; nothing was sent.
    Duplicate,
    /// Delivery (or the claim) failed; the key was released.
    Failed,
}

pub struct Dispatcher {
    ledger: Arc<dyn StateStore>,
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    topic_id: Option<i32>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn StateStore>,
        transport: Arc<dyn ChatTransport>,
        chat_id: i64,
        topic_id: Option<i32>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            transport,
            chat_id,
            topic_id,
            send_timeout,
        }
    }

    /// Deliver `notification` at most once per `key`.
    ///
    /// The key is claimed with a single conditional insert before sending, so
    /// concurrent callers cannot both send. `also_claims` are keys the same
    /// message satisfies; they are claimed alongside and released with `key`
    /// when delivery fails.
    pub async fn deliver(
        &self,
        notification: &Notification,
        key: &NotificationKey,
        also_claims: &[NotificationKey],
    ) -> DeliveryOutcome {
        let extra = json!({ "recipients": notification.recipient_ids }).to_string();
        match self.ledger.try_mark_sent(key, Some(&extra)).await {
            Ok(true) => {}
            Ok(false) => {
                info!(key = %key, "Notification already sent, skipping");
                return DeliveryOutcome::Duplicate;
            }
            Err(e) => {
                error!(key = %key, "Failed to claim notification key: {}", e);
                return DeliveryOutcome::Failed;
            }
        }

        let mut claimed_extra = Vec::new();
        for extra_key in also_claims {
            match self.ledger.try_mark_sent(extra_key, Some(&extra)).await {
                Ok(true) => claimed_extra.push(extra_key),
                Ok(false) => {}
                Err(e) => warn!(key = %extra_key, "Failed to claim companion key: {}", e),
            }
        }

        match self.send_with_fallback(&notification.html).await {
            Ok(message_id) => {
                info!(
                    key = %key,
                    task_id = notification.task_id,
                    message_id,
                    recipients = ?notification.recipient_ids,
                    "Notification sent"
                );
                DeliveryOutcome::Sent
            }
            Err(e) => {
                error!(
                    key = %key,
                    task_id = notification.task_id,
                    recipients = ?notification.recipient_ids,
                    text = %notification.text,
                    "Notification delivery failed: {}", e
                );
                for k in std::iter::once(key).chain(claimed_extra) {
                    if let Err(clear_err) = self.ledger.clear_sent(k).await {
                        error!(key = %k, "Failed to release notification key: {}", clear_err);
                    }
                }
                DeliveryOutcome::Failed
            }
        }
    }

    /// Send once; on "topic not found" retry exactly once without the topic.
    async fn send_with_fallback(&self, html: &str) -> Result<i32, SendError> {
        match self.send_once(html, self.topic_id).await {
            Err(SendError::TopicNotFound(reason)) if self.topic_id.is_some() => {
                warn!(
                    chat_id = self.chat_id,
                    topic_id = ?self.topic_id,
                    "Topic not found ({}), resending without topic", reason
                );
                self.send_once(html, None).await
            }
            other => other,
        }
    }

    async fn send_once(&self, html: &str, topic_id: Option<i32>) -> Result<i32, SendError> {
        match tokio::time::timeout(
            self.send_timeout,
            self.transport.send_message(self.chat_id, html, topic_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.send_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use crate::testing::RecordingTransport;
    use crate::traits::{NotificationLedger, NotificationType};

    fn notification() -> Notification {
        Notification {
            task_id: 7,
            kind: NotificationType::Overdue,
            text: "вы просрочили задачу «X»".into(),
            html: "@a, вы просрочили задачу «X»".into(),
            recipient_ids: vec![1],
            reports_overdue: true,
        }
    }

    fn dispatcher(
        store: Arc<MemoryStateStore>,
        transport: Arc<RecordingTransport>,
        topic: Option<i32>,
    ) -> Dispatcher {
        Dispatcher::new(store, transport, -100, topic, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn sends_once_per_key() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let d = dispatcher(store.clone(), transport.clone(), None);
        let key = NotificationKey::new(7, NotificationType::Overdue, "2025-01-10T18:00");

        assert_eq!(d.deliver(&notification(), &key, &[]).await, DeliveryOutcome::Sent);
        assert_eq!(d.deliver(&notification(), &key, &[]).await, DeliveryOutcome::Duplicate);
        assert_eq!(transport.sent().len(), 1);
        assert!(store.notification_sent(&key).await.unwrap());
    }

    #[tokio::test]
    async fn failure_releases_all_claimed_keys() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(SendError::Delivery("chat not found".into()));
        let d = dispatcher(store.clone(), transport.clone(), None);
        let key = NotificationKey::new(7, NotificationType::TaskUpdated, "ONTASKUPDATE:abc");
        let companion = NotificationKey::new(7, NotificationType::Overdue, "2025-01-10T18:00");

        let outcome = d.deliver(&notification(), &key, &[companion.clone()]).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert!(!store.notification_sent(&key).await.unwrap());
        assert!(!store.notification_sent(&companion).await.unwrap());

        assert_eq!(d.deliver(&notification(), &key, &[companion.clone()]).await, DeliveryOutcome::Sent);
        assert!(store.notification_sent(&companion).await.unwrap());
    }

    #[tokio::test]
    async fn already_claimed_companion_is_not_released_on_failure() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let companion = NotificationKey::new(7, NotificationType::Overdue, "2025-01-10T18:00");
        store.try_mark_sent(&companion, None).await.unwrap();
        transport.fail_next(SendError::Delivery("boom".into()));
        let d = dispatcher(store.clone(), transport, None);
        let key = NotificationKey::new(7, NotificationType::TaskUpdated, "ONTASKUPDATE:abc");

        assert_eq!(d.deliver(&notification(), &key, &[companion.clone()]).await, DeliveryOutcome::Failed);
        assert!(store.notification_sent(&companion).await.unwrap());
    }

    #[tokio::test]
    async fn topic_not_found_retries_once_without_topic() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(SendError::TopicNotFound("message thread not found".into()));
        let d = dispatcher(store, transport.clone(), Some(42));
        let key = NotificationKey::new(7, NotificationType::Overdue, "x");

        assert_eq!(d.deliver(&notification(), &key, &[]).await, DeliveryOutcome::Sent);
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].topic_id, Some(42));
        assert_eq!(attempts[1].topic_id, None);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(SendError::Delivery("bad request".into()));
        let d = dispatcher(store, transport.clone(), Some(42));
        let key = NotificationKey::new(7, NotificationType::Overdue, "x");

        assert_eq!(d.deliver(&notification(), &key, &[]).await, DeliveryOutcome::Failed);
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out() {
        let store = Arc::new(MemoryStateStore::new());
        let transport = Arc::new(RecordingTransport::new());
        transport.set_delay(Duration::from_secs(60));
        let d = dispatcher(store.clone(), transport, None);
        let key = NotificationKey::new(7, NotificationType::Overdue, "x");

        assert_eq!(d.deliver(&notification(), &key, &[]).await, DeliveryOutcome::Failed);
        assert!(!store.notification_sent(&key).await.unwrap());
    }
}
