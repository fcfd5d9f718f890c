//! Test infrastructure: FakeTaskDirectory, RecordingTransport, FixedClock and TestHarness.
//!
//! Provides a fully wired notification engine with scripted CRM data, a
//! recording chat transport and in-memory state, suitable for integration
//! tests that exercise the real router and scanner.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::notifications::{deadline, status, DeadlineScanner, Engine, EngineSettings, EventRouter};
use crate::state::MemoryStateStore;
use crate::traits::{
    ChatIdentity, ChatTransport, Clock, IdentityLink, MemberHandle, NotificationKey,
    NotificationLedger, NotificationRecord, NotificationType, SendError, SnapshotStore,
    StateStore, TaskComment, TaskDirectory, TaskSnapshot,
};

pub const TEST_CHAT_ID: i64 = -100_123;

// ---------------------------------------------------------------------------
// FakeTaskDirectory
// ---------------------------------------------------------------------------

/// Scripted CRM. Tasks and comments are whatever the test put there.
#[derive(Default)]
pub struct FakeTaskDirectory {
    tasks: Mutex<HashMap<i64, TaskSnapshot>>,
    comments: Mutex<HashMap<(i64, i64), TaskComment>>,
    failing: AtomicBool,
    pub get_task_calls: AtomicUsize,
}

impl FakeTaskDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_task(&self, task: TaskSnapshot) {
        self.tasks.lock().unwrap().insert(task.task_id, task);
    }

    pub fn remove_task(&self, task_id: i64) {
        self.tasks.lock().unwrap().remove(&task_id);
    }

    pub fn put_comment(&self, task_id: i64, comment: TaskComment) {
        self.comments
            .lock()
            .unwrap()
            .insert((task_id, comment.id), comment);
    }

    /// Make every fetch fail as if the CRM were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("CRM unreachable");
        }
        Ok(())
    }

    fn matching(&self, keep: impl Fn(&TaskSnapshot) -> bool) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| keep(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.task_id);
        tasks
    }
}

#[async_trait]
impl TaskDirectory for FakeTaskDirectory {
    async fn get_task(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>> {
        self.get_task_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.tasks.lock().unwrap().get(&task_id).cloned())
    }

    async fn list_overdue_tasks(
        &self,
        now: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>> {
        self.check_reachable()?;
        Ok(self.matching(|t| {
            !status::is_terminal(t.status.as_deref(), exclude_statuses)
                && t.deadline
                    .as_deref()
                    .and_then(|d| deadline::is_past(d, now))
                    .unwrap_or(false)
        }))
    }

    async fn list_tasks_with_deadline_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_statuses: &[String],
    ) -> anyhow::Result<Vec<TaskSnapshot>> {
        self.check_reachable()?;
        Ok(self.matching(|t| {
            !status::is_terminal(t.status.as_deref(), exclude_statuses)
                && t.deadline
                    .as_deref()
                    .and_then(deadline::parse)
                    .map(|d| d >= start && d <= end)
                    .unwrap_or(false)
        }))
    }

    async fn get_comment(
        &self,
        task_id: i64,
        comment_id: i64,
    ) -> anyhow::Result<Option<TaskComment>> {
        self.check_reachable()?;
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&(task_id, comment_id))
            .cloned())
    }

    fn task_url(&self, task_id: i64, viewer_id: Option<i64>) -> String {
        format!(
            "https://crm.test/company/personal/user/{}/tasks/task/view/{}/",
            viewer_id.unwrap_or(0),
            task_id
        )
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub html: String,
    pub topic_id: Option<i32>,
}

/// Chat transport that records every attempt and can be told to fail.
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    attempts: Mutex<Vec<SentMessage>>,
    failures: Mutex<VecDeque<SendError>>,
    delay: Mutex<Option<Duration>>,
    members: Mutex<HashMap<i64, MemberHandle>>,
    next_message_id: AtomicI32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
            next_message_id: AtomicI32::new(1),
        }
    }

    /// Queue a failure for the next send attempt.
    pub fn fail_next(&self, err: SendError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Make every send take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn add_member(&self, user_id: i64, handle: MemberHandle) {
        self.members.lock().unwrap().insert(user_id, handle);
    }

    /// Successfully delivered messages.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Every send attempt, including failed ones.
    pub fn attempts(&self) -> Vec<SentMessage> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        html: &str,
        topic_id: Option<i32>,
    ) -> Result<i32, SendError> {
        let message = SentMessage {
            chat_id,
            html: html.to_string(),
            topic_id,
        };
        self.attempts.lock().unwrap().push(message.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.sent.lock().unwrap().push(message);
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn resolve_display_handle(
        &self,
        _chat_id: i64,
        user_id: i64,
    ) -> anyhow::Result<Option<MemberHandle>> {
        Ok(self.members.lock().unwrap().get(&user_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// FixedClock
// ---------------------------------------------------------------------------

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Clock frozen at an RFC 3339 instant.
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid RFC 3339 instant")
            .with_timezone(&Utc);
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, rfc3339: &str) {
        *self.now.lock().unwrap() = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid RFC 3339 instant")
            .with_timezone(&Utc);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// CountingStore
// ---------------------------------------------------------------------------

/// Memory store that counts dedup-ledger and snapshot traffic.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStateStore,
    pub ledger_calls: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_calls(&self) -> usize {
        self.ledger_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationLedger for CountingStore {
    async fn notification_sent(&self, key: &NotificationKey) -> anyhow::Result<bool> {
        self.ledger_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.notification_sent(key).await
    }

    async fn try_mark_sent(
        &self,
        key: &NotificationKey,
        extra_data: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.ledger_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.try_mark_sent(key, extra_data).await
    }

    async fn clear_sent(&self, key: &NotificationKey) -> anyhow::Result<()> {
        self.ledger_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_sent(key).await
    }

    async fn notification_history(
        &self,
        task_id: Option<i64>,
        kind: Option<NotificationType>,
        limit: i64,
    ) -> anyhow::Result<Vec<NotificationRecord>> {
        self.inner.notification_history(task_id, kind, limit).await
    }
}

#[async_trait]
impl SnapshotStore for CountingStore {
    async fn get_snapshot(&self, task_id: i64) -> anyhow::Result<Option<TaskSnapshot>> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_snapshot(task_id).await
    }

    async fn save_snapshot(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.save_snapshot(snapshot).await
    }

    async fn was_task_created_via_bot(&self, task_id: i64) -> anyhow::Result<bool> {
        self.inner.was_task_created_via_bot(task_id).await
    }

    async fn record_task_created_via_bot(
        &self,
        task_id: i64,
        chat_id: Option<i64>,
    ) -> anyhow::Result<()> {
        self.inner.record_task_created_via_bot(task_id, chat_id).await
    }
}

#[async_trait]
impl IdentityLink for CountingStore {
    async fn chat_identity_for(&self, crm_user_id: i64) -> anyhow::Result<Option<ChatIdentity>> {
        self.inner.chat_identity_for(crm_user_id).await
    }

    async fn crm_user_for(&self, telegram_id: i64) -> anyhow::Result<Option<i64>> {
        self.inner.crm_user_for(telegram_id).await
    }

    async fn link(&self, identity: &ChatIdentity, crm_user_id: i64) -> anyhow::Result<()> {
        self.inner.link(identity, crm_user_id).await
    }

    async fn unlink(&self, telegram_id: i64) -> anyhow::Result<bool> {
        self.inner.unlink(telegram_id).await
    }

    async fn all_links(&self) -> anyhow::Result<Vec<(ChatIdentity, i64)>> {
        self.inner.all_links().await
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub router: EventRouter,
    pub scanner: DeadlineScanner,
    pub crm: Arc<FakeTaskDirectory>,
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<FixedClock>,
}

impl TestHarness {
    /// Link a chat user to a CRM user.
    pub async fn link(&self, telegram_id: i64, crm_user_id: i64, username: Option<&str>) {
        let mut identity = ChatIdentity::new(telegram_id);
        if let Some(username) = username {
            identity = identity.with_username(username);
        }
        self.store.link(&identity, crm_user_id).await.unwrap();
    }

    /// Mark a task as created through the bot.
    pub async fn track(&self, task_id: i64) {
        self.store
            .record_task_created_via_bot(task_id, Some(TEST_CHAT_ID))
            .await
            .unwrap();
    }

    pub fn sent_html(&self) -> Vec<String> {
        self.transport.sent().into_iter().map(|m| m.html).collect()
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        chat_id: TEST_CHAT_ID,
        ..EngineSettings::default()
    }
}

/// Engine on an in-memory store, clock at 2025-01-11 09:00 Moscow time.
pub fn setup_test_engine() -> TestHarness {
    setup_test_engine_with(Arc::new(MemoryStateStore::new()), test_settings())
}

pub fn setup_test_engine_with(store: Arc<dyn StateStore>, settings: EngineSettings) -> TestHarness {
    let crm = Arc::new(FakeTaskDirectory::new());
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(FixedClock::at("2025-01-11T09:00:00+03:00"));
    let engine = Arc::new(Engine::new(
        crm.clone(),
        store.clone(),
        transport.clone(),
        clock.clone(),
        settings,
    ));
    let router = EventRouter::new(engine.clone());
    let scanner = DeadlineScanner::new(engine.clone(), "hourly").unwrap();
    TestHarness {
        engine,
        router,
        scanner,
        crm,
        store,
        transport,
        clock,
    }
}
