//! Periodic deadline scan: overdue tasks and tasks about to become overdue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use super::composer::NotificationEvent;
use super::dispatch::DeliveryOutcome;
use super::{deadline, status, Engine};
use crate::traits::{NotificationKey, NotificationType, TaskSnapshot};

pub struct DeadlineScanner {
    engine: Arc<Engine>,
    cron_expr: String,
}

impl DeadlineScanner {
    pub fn new(engine: Arc<Engine>, schedule: &str) -> anyhow::Result<Self> {
        let cron_expr = parse_schedule(schedule)?;
        Ok(Self { engine, cron_expr })
    }

    pub fn cron_expr(&self) -> &str {
        &self.cron_expr
    }

    /// Spawn the scan loop as a background task.
    pub fn spawn(self: Arc<Self>) {
        let tz = self.engine.settings.timezone;
        info!(cron = %self.cron_expr, %tz, "Deadline scanner spawned");
        tokio::spawn(async move {
            loop {
                let delay = match compute_next_run(&self.cron_expr, tz) {
                    Ok(next) => (next.with_timezone(&Utc) - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_secs(1)),
                    Err(e) => {
                        error!("Deadline scan schedule error: {}", e);
                        Duration::from_secs(60)
                    }
                };
                tokio::time::sleep(delay).await;
                self.run_periodic_check().await;
            }
        });
    }

    pub async fn run_periodic_check(&self) {
        let overdue = self.check_overdue_tasks().await;
        let warnings = self.check_deadline_warnings().await;
        info!(overdue, warnings, "Deadline scan complete");
    }

    /// Returns the number of notifications sent.
    pub async fn check_overdue_tasks(&self) -> usize {
        let engine = &self.engine;
        if !engine.settings.enable_overdue_notifications {
            return 0;
        }
        let now = engine.now_local();
        info!("Checking overdue tasks");
        let tasks = match engine
            .crm
            .list_overdue_tasks(now, &engine.settings.terminal_statuses)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list overdue tasks: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for task in &tasks {
            match self.notify_overdue(task, now).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => error!(task_id = task.task_id, "Overdue check failed: {}", e),
            }
        }
        sent
    }

    async fn notify_overdue(&self, task: &TaskSnapshot, now: NaiveDateTime) -> anyhow::Result<bool> {
        let engine = &self.engine;
        let Some(raw) = task.deadline.as_deref() else {
            return Ok(false);
        };
        if status::is_terminal(task.status.as_deref(), &engine.settings.terminal_statuses) {
            return Ok(false);
        }
        if deadline::is_past(raw, now) == Some(false) {
            debug!(task_id = task.task_id, deadline = raw, "Listed as overdue but deadline is ahead");
            return Ok(false);
        }
        if !engine.store.was_task_created_via_bot(task.task_id).await? {
            return Ok(false);
        }
        let key = NotificationKey::new(task.task_id, NotificationType::Overdue, deadline::normalize(raw));
        if engine.store.notification_sent(&key).await? {
            return Ok(false);
        }

        let recipients = engine
            .recipients(task.responsible_id, task.created_by_id, None)
            .await;
        let Some(n) = engine
            .composer
            .compose(&NotificationEvent::ScanOverdue, &engine.task_ref(task), &recipients)
        else {
            debug!(task_id = task.task_id, "No linked recipients for overdue task");
            return Ok(false);
        };
        Ok(engine.dispatcher.deliver(&n, &key, &[]).await == DeliveryOutcome::Sent)
    }

    /// Returns the number of notifications sent.
    pub async fn check_deadline_warnings(&self) -> usize {
        let engine = &self.engine;
        if !engine.settings.enable_deadline_warnings {
            return 0;
        }
        let hours = engine.settings.deadline_warning_hours;
        let now = engine.now_local();
        let until = now + chrono::Duration::hours(hours);
        info!(hours, "Checking tasks with approaching deadlines");
        let tasks = match engine
            .crm
            .list_tasks_with_deadline_between(now, until, &engine.settings.terminal_statuses)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list tasks with approaching deadlines: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for task in &tasks {
            match self.notify_deadline_warning(task, now).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => error!(task_id = task.task_id, "Deadline warning check failed: {}", e),
            }
        }
        sent
    }

    async fn notify_deadline_warning(
        &self,
        task: &TaskSnapshot,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        let engine = &self.engine;
        let Some(raw) = task.deadline.as_deref() else {
            return Ok(false);
        };
        if status::is_terminal(task.status.as_deref(), &engine.settings.terminal_statuses) {
            return Ok(false);
        }
        if deadline::is_past(raw, now) == Some(true) {
            return Ok(false);
        }
        if !engine.store.was_task_created_via_bot(task.task_id).await? {
            return Ok(false);
        }
        let key = NotificationKey::new(
            task.task_id,
            NotificationType::DeadlineWarning,
            deadline::normalize(raw),
        );
        if engine.store.notification_sent(&key).await? {
            return Ok(false);
        }

        let hours_left = deadline::hours_until(raw, now).unwrap_or(engine.settings.deadline_warning_hours);
        let recipients = engine
            .recipients(task.responsible_id, task.created_by_id, None)
            .await;
        let Some(n) = engine.composer.compose(
            &NotificationEvent::ScanDeadlineApproaching { hours_left },
            &engine.task_ref(task),
            &recipients,
        ) else {
            debug!(task_id = task.task_id, "No linked recipients for deadline warning");
            return Ok(false);
        };
        Ok(engine.dispatcher.deliver(&n, &key, &[]).await == DeliveryOutcome::Sent)
    }
}

static INTERVAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^every\s+(\d+)\s*(m|min|mins|minutes?|h|hrs?|hours?)$")
        .expect("interval regex must compile")
});
static AT_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(daily|weekdays?)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$")
        .expect("at-time regex must compile")
});

/// Turn the `schedule` setting into a 5-field cron expression. The
/// expression is later evaluated as wall-clock time in the home timezone,
/// so "daily at 9am" means 09:00 at the portal, not on the host.
pub fn parse_schedule(input: &str) -> anyhow::Result<String> {
    let input = input.trim();

    match input.to_lowercase().as_str() {
        "hourly" => return Ok("0 * * * *".to_string()),
        "daily" => return Ok("0 0 * * *".to_string()),
        _ => {}
    }

    if let Some(caps) = INTERVAL_RE.captures(input) {
        let n: u32 = caps[1].parse()?;
        let hours = caps[2].to_lowercase().starts_with('h');
        let limit = if hours { 23 } else { 59 };
        if n == 0 || n > limit {
            anyhow::bail!(
                "Scan interval '{}' must be between 1 and {} {}",
                input,
                limit,
                if hours { "hours" } else { "minutes" }
            );
        }
        return Ok(if hours {
            format!("0 */{} * * *", n)
        } else {
            format!("*/{} * * * *", n)
        });
    }

    if let Some(caps) = AT_TIME_RE.captures(input) {
        let (hour, minute) = scan_time(&caps)?;
        let days = if caps[1].to_lowercase().starts_with("weekday") {
            "1-5"
        } else {
            "*"
        };
        return Ok(format!("{} {} * * {}", minute, hour, days));
    }

    if input.split_whitespace().count() == 5 {
        input
            .parse::<Cron>()
            .map_err(|e| anyhow::anyhow!("Invalid scan cron expression '{}': {}", input, e))?;
        return Ok(input.to_string());
    }

    anyhow::bail!(
        "Unrecognized scan schedule '{}'. Expected 'hourly', 'daily', 'every 30m', 'every 2h', \
         'daily at 9am', 'weekdays at 9:30' or a 5-field cron expression (home timezone).",
        input
    )
}

/// Hour and minute of an "at" schedule, with optional am/pm.
fn scan_time(caps: &regex::Captures) -> anyhow::Result<(u32, u32)> {
    let mut hour: u32 = caps[2].parse()?;
    let minute: u32 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse())?;
    match caps.get(4).map(|m| m.as_str().to_lowercase()).as_deref() {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }
    if hour > 23 || minute > 59 {
        anyhow::bail!("Scan time {:02}:{:02} is not a valid time of day", hour, minute);
    }
    Ok((hour, minute))
}

/// Next occurrence of `cron_expr` evaluated as wall-clock time in `tz`.
pub fn compute_next_run(cron_expr: &str, tz: Tz) -> anyhow::Result<DateTime<Tz>> {
    let cron: Cron = cron_expr
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse cron '{}': {}", cron_expr, e))?;

    cron.find_next_occurrence(&Utc::now().with_timezone(&tz), false)
        .map_err(|e| anyhow::anyhow!("No next occurrence for '{}': {}", cron_expr, e))
}
