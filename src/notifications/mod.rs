//! Task-change notification engine.
//!
//! Two entry points share one pipeline: [`EventRouter`] handles CRM webhook
//! events, [`DeadlineScanner`] runs the periodic overdue/deadline checks. Both
//! diff with [`ChangeDetector`], compose with [`NotificationComposer`] and
//! deliver through [`Dispatcher`], which claims a ledger key before sending.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use chrono_tz::Tz;

pub mod composer;
pub mod deadline;
pub mod detector;
pub mod dispatch;
pub mod fields;
pub mod router;
pub mod scan;
pub mod status;

pub use composer::{NotificationComposer, Recipients, TaskRef};
pub use detector::ChangeDetector;
pub use dispatch::Dispatcher;
pub use router::{EventName, EventRouter, WebhookEvent};
pub use scan::DeadlineScanner;

use crate::traits::{ChatTransport, Clock, StateStore, TaskDirectory, TaskSnapshot};

/// Runtime knobs of the engine, resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Chat that receives every notification.
    pub chat_id: i64,
    pub topic_id: Option<i32>,
    pub timezone: Tz,
    pub terminal_statuses: Vec<String>,
    pub deadline_warning_hours: i64,
    pub send_timeout: Duration,
    pub enable_overdue_notifications: bool,
    pub enable_deadline_warnings: bool,
    pub enable_comment_notifications: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chat_id: 0,
            topic_id: None,
            timezone: chrono_tz::Europe::Moscow,
            terminal_statuses: vec!["5".to_string()],
            deadline_warning_hours: 24,
            send_timeout: Duration::from_secs(20),
            enable_overdue_notifications: true,
            enable_deadline_warnings: true,
            enable_comment_notifications: true,
        }
    }
}

/// Collaborators and settings shared by the router and the scanner.
pub struct Engine {
    pub(crate) crm: Arc<dyn TaskDirectory>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) transport: Arc<dyn ChatTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
    pub(crate) detector: ChangeDetector,
    pub(crate) composer: NotificationComposer,
    pub(crate) dispatcher: Dispatcher,
}

impl Engine {
    pub fn new(
        crm: Arc<dyn TaskDirectory>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let detector = ChangeDetector::new(settings.terminal_statuses.clone());
        let composer = NotificationComposer::new(settings.timezone);
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            settings.chat_id,
            settings.topic_id,
            settings.send_timeout,
        );
        Self {
            crm,
            store,
            transport,
            clock,
            settings,
            detector,
            composer,
            dispatcher,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current wall-clock time in the home timezone.
    pub(crate) fn now_local(&self) -> NaiveDateTime {
        self.clock
            .now()
            .with_timezone(&self.settings.timezone)
            .naive_local()
    }

    /// Deadline strictly passed and status not terminal.
    pub(crate) fn is_overdue(&self, task: &TaskSnapshot, now: NaiveDateTime) -> bool {
        let Some(raw) = task.deadline.as_deref() else {
            return false;
        };
        !status::is_terminal(task.status.as_deref(), &self.settings.terminal_statuses)
            && deadline::is_past(raw, now) == Some(true)
    }

    pub(crate) async fn recipients(
        &self,
        responsible_id: Option<i64>,
        created_by_id: Option<i64>,
        author_id: Option<i64>,
    ) -> Recipients {
        let mut recipients =
            Recipients::resolve(self.store.as_ref(), responsible_id, created_by_id, author_id).await;
        if !recipients.is_empty() {
            recipients
                .enrich(self.transport.as_ref(), self.settings.chat_id)
                .await;
        }
        recipients
    }

    pub(crate) fn task_ref(&self, task: &TaskSnapshot) -> TaskRef {
        TaskRef::from_snapshot(task, self.crm.task_url(task.task_id, task.responsible_id))
    }
}
