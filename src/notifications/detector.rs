//! Change detection between two observations of the same task.

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use super::{deadline, fields, status};
use crate::traits::{FieldBag, TaskSnapshot};

/// Before/after values of one changed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange<T> {
    pub before: T,
    pub after: T,
}

/// What semantically changed between two observations of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub deadline: Option<FieldChange<String>>,
    pub status: Option<FieldChange<String>>,
    pub responsible: Option<FieldChange<i64>>,
    pub title: Option<FieldChange<String>>,
    pub deadline_overdue: bool,
    /// Human-readable descriptions, in deadline/status/responsible/title order.
    pub changes: Vec<String>,
}

impl DiffResult {
    pub fn deadline_changed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn status_changed(&self) -> bool {
        self.status.is_some()
    }

    pub fn responsible_changed(&self) -> bool {
        self.responsible.is_some()
    }

    pub fn title_changed(&self) -> bool {
        self.title.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// One side of a comparison. `None` means "unknown", never "cleared".
#[derive(Debug, Default)]
struct Observed {
    title: Option<String>,
    deadline: Option<String>,
    status: Option<String>,
    responsible: Option<i64>,
}

impl Observed {
    fn from_snapshot(s: &TaskSnapshot) -> Self {
        let title = s.title.trim();
        Self {
            title: (!title.is_empty()).then(|| title.to_string()),
            deadline: s.deadline.clone().filter(|d| !d.trim().is_empty()),
            status: s.status.clone().filter(|v| !v.trim().is_empty()),
            responsible: s.responsible_id.filter(|id| *id != 0),
        }
    }

    fn from_bag(bag: &FieldBag) -> Self {
        Self {
            title: fields::text(bag, fields::TITLE_KEYS),
            deadline: fields::text(bag, fields::DEADLINE_KEYS),
            status: fields::text(bag, fields::STATUS_KEYS),
            responsible: fields::nonzero_id(bag, fields::RESPONSIBLE_KEYS),
        }
    }
}

fn both<T: Clone>(before: &Option<T>, after: &Option<T>) -> Option<(T, T)> {
    Some((before.clone()?, after.clone()?))
}

pub struct ChangeDetector {
    terminal_statuses: Vec<String>,
}

impl ChangeDetector {
    pub fn new(terminal_statuses: Vec<String>) -> Self {
        Self { terminal_statuses }
    }

    /// Diff a task against its previous observation.
    ///
    /// A webhook's own before/after bags win when both carry real task
    /// fields; otherwise `current` is compared with `previous`. With neither
    /// available only the current deadline is evaluated.
    pub fn detect(
        &self,
        current: &TaskSnapshot,
        previous: Option<&TaskSnapshot>,
        event_before: Option<&FieldBag>,
        event_after: Option<&FieldBag>,
        now: NaiveDateTime,
    ) -> DiffResult {
        let mut diff = DiffResult::default();
        let terminal = status::is_terminal(current.status.as_deref(), &self.terminal_statuses);

        let sides = match (event_before, event_after) {
            (Some(before), Some(after))
                if fields::carries_tracked_fields(before) && fields::carries_tracked_fields(after) =>
            {
                debug!(task_id = current.task_id, "Diffing webhook before/after payload");
                Some((Observed::from_bag(before), Observed::from_bag(after)))
            }
            _ => previous.map(|prev| (Observed::from_snapshot(prev), Observed::from_snapshot(current))),
        };

        let Some((before, after)) = sides else {
            if let Some(raw) = current.deadline.as_deref() {
                if !terminal && deadline::is_past(raw, now) == Some(true) {
                    diff.deadline_overdue = true;
                    diff.changes.push("дедлайн просрочен".to_string());
                }
            }
            return diff;
        };

        if let Some((old, new)) = both(&before.deadline, &after.deadline) {
            if !deadline::same_instant(&old, &new) {
                match deadline::is_past(&new, now) {
                    Some(true) if !terminal => {
                        diff.deadline_overdue = true;
                        diff.changes.push("дедлайн просрочен".to_string());
                    }
                    Some(_) => diff
                        .changes
                        .push(format!("дедлайн изменен на {}", deadline::display(&new))),
                    None => {
                        warn!(
                            task_id = current.task_id,
                            deadline = %new,
                            "Unparseable deadline; overdue state unknown"
                        );
                        diff.changes.push(format!("дедлайн изменен на {}", new.trim()));
                    }
                }
                diff.deadline = Some(FieldChange { before: old, after: new });
            }
        }

        if let Some((old, new)) = both(&before.status, &after.status) {
            if old.trim() != new.trim() {
                diff.changes
                    .push(format!("статус изменен на \"{}\"", status::status_name(&new)));
                diff.status = Some(FieldChange { before: old, after: new });
            }
        }

        if let Some((old, new)) = both(&before.responsible, &after.responsible) {
            if old != new {
                diff.changes.push("ответственный изменен".to_string());
                diff.responsible = Some(FieldChange { before: old, after: new });
            }
        }

        if let Some((old, new)) = both(&before.title, &after.title) {
            if old.trim() != new.trim() {
                diff.changes
                    .push(format!("название изменено на «{}»", new.trim()));
                diff.title = Some(FieldChange { before: old, after: new });
            }
        }

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-01-11 09:00", "%Y-%m-%d %H:%M").unwrap()
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(vec!["5".to_string()])
    }

    fn zoom_task() -> TaskSnapshot {
        TaskSnapshot {
            task_id: 41127,
            title: "Зум по встрече".into(),
            deadline: Some("2025-01-10 18:00".into()),
            status: Some("2".into()),
            responsible_id: Some(55),
            ..Default::default()
        }
    }

    fn bag(v: serde_json::Value) -> FieldBag {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn first_sighting_flags_only_overdue() {
        let diff = detector().detect(&zoom_task(), None, None, None, now());
        assert!(diff.deadline_overdue);
        assert_eq!(diff.changes, vec!["дедлайн просрочен".to_string()]);
        assert!(!diff.deadline_changed());
        assert!(!diff.status_changed());
        assert!(!diff.responsible_changed());
        assert!(!diff.title_changed());
    }

    #[test]
    fn first_sighting_of_future_deadline_is_empty() {
        let mut task = zoom_task();
        task.deadline = Some("2025-02-01 10:00".into());
        let diff = detector().detect(&task, None, None, None, now());
        assert_eq!(diff, DiffResult::default());
    }

    #[test]
    fn terminal_task_is_never_overdue() {
        let mut task = zoom_task();
        task.status = Some("5".into());
        let diff = detector().detect(&task, None, None, None, now());
        assert!(!diff.deadline_overdue);
        assert!(diff.is_empty());
    }

    #[test]
    fn status_change_against_previous_snapshot() {
        let mut previous = zoom_task();
        previous.status = Some("1".into());
        let mut current = zoom_task();
        current.deadline = Some("2025-02-01 10:00".into());
        previous.deadline = current.deadline.clone();

        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(diff.status_changed());
        assert_eq!(diff.changes, vec!["статус изменен на \"В работе\"".to_string()]);
        assert!(!diff.deadline_overdue);
    }

    #[test]
    fn unknown_before_is_not_a_change() {
        let previous = TaskSnapshot {
            task_id: 41127,
            ..Default::default()
        };
        let mut current = zoom_task();
        current.deadline = Some("2025-02-01 10:00".into());
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(diff.is_empty());
    }

    #[test]
    fn reformatted_deadline_is_not_a_change() {
        let mut previous = zoom_task();
        previous.deadline = Some("2025-02-01T10:00:00+03:00".into());
        let mut current = zoom_task();
        current.deadline = Some("01.02.2025 10:00".into());
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(!diff.deadline_changed());
        assert!(diff.is_empty());
    }

    #[test]
    fn moved_deadline_reports_new_value() {
        let mut previous = zoom_task();
        previous.deadline = Some("2025-02-01 10:00".into());
        let mut current = zoom_task();
        current.deadline = Some("2025-02-03T12:30:00+03:00".into());
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(diff.deadline_changed());
        assert!(!diff.deadline_overdue);
        assert_eq!(diff.changes, vec!["дедлайн изменен на 03.02.2025 12:30".to_string()]);
    }

    #[test]
    fn deadline_moved_into_past_reports_overdue_instead() {
        let mut previous = zoom_task();
        previous.deadline = Some("2025-02-01 10:00".into());
        let current = zoom_task();
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(diff.deadline_changed());
        assert!(diff.deadline_overdue);
        assert_eq!(diff.changes, vec!["дедлайн просрочен".to_string()]);
    }

    #[test]
    fn unparseable_new_deadline_degrades_to_plain_change() {
        let mut previous = zoom_task();
        previous.deadline = Some("2025-02-01 10:00".into());
        let mut current = zoom_task();
        current.deadline = Some("когда-нибудь".into());
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert!(diff.deadline_changed());
        assert!(!diff.deadline_overdue);
        assert_eq!(diff.changes, vec!["дедлайн изменен на когда-нибудь".to_string()]);
    }

    #[test]
    fn changes_are_listed_in_fixed_order() {
        let previous = TaskSnapshot {
            task_id: 1,
            title: "Старое".into(),
            deadline: Some("2025-02-01 10:00".into()),
            status: Some("1".into()),
            responsible_id: Some(10),
            ..Default::default()
        };
        let current = TaskSnapshot {
            task_id: 1,
            title: "Новое".into(),
            deadline: Some("2025-02-02 10:00".into()),
            status: Some("3".into()),
            responsible_id: Some(11),
            ..Default::default()
        };
        let diff = detector().detect(&current, Some(&previous), None, None, now());
        assert_eq!(
            diff.changes,
            vec![
                "дедлайн изменен на 02.02.2025 10:00".to_string(),
                "статус изменен на \"Выполняется\"".to_string(),
                "ответственный изменен".to_string(),
                "название изменено на «Новое»".to_string(),
            ]
        );
        assert_eq!(diff.responsible, Some(FieldChange { before: 10, after: 11 }));
    }

    #[test]
    fn payload_pair_wins_over_snapshot() {
        let mut previous = zoom_task();
        previous.status = Some("2".into());
        let current = zoom_task();
        let before = bag(json!({"ID": "41127", "STATUS": "1"}));
        let after = bag(json!({"ID": "41127", "STATUS": "4"}));
        let diff = detector().detect(&current, Some(&previous), Some(&before), Some(&after), now());
        assert_eq!(diff.changes, vec!["статус изменен на \"Ожидает контроля\"".to_string()]);
    }

    #[test]
    fn identifier_only_payload_falls_back_to_snapshot() {
        let mut previous = zoom_task();
        previous.status = Some("1".into());
        previous.deadline = Some("2025-02-01 10:00".into());
        let mut current = zoom_task();
        current.deadline = Some("2025-02-01 10:00".into());
        let before = bag(json!({"ID": "41127"}));
        let after = bag(json!({"ID": "41127"}));
        let diff = detector().detect(&current, Some(&previous), Some(&before), Some(&after), now());
        assert!(diff.status_changed());
    }
}
