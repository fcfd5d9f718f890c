//! Tolerant extraction of logical fields from CRM field bags.
//!
//! The CRM spells the same field differently depending on the API surface
//! (`DEADLINE` in webhooks, `deadline` in REST v2, `RESPONSIBLE_ID` vs
//! `responsibleId`). Every logical field is described by an ordered list of
//! candidate keys; exact matches are tried in order, then a case- and
//! underscore-insensitive match against the same candidates.

use serde_json::Value;

use crate::traits::{FieldBag, TaskSnapshot};

pub const ID_KEYS: &[&str] = &["ID", "id", "taskId", "TASK_ID"];
pub const TASK_ID_KEYS: &[&str] = &["TASK_ID", "taskId", "task_id", "TASKID"];
pub const TITLE_KEYS: &[&str] = &["TITLE", "title"];
pub const DEADLINE_KEYS: &[&str] = &["DEADLINE", "deadline"];
pub const STATUS_KEYS: &[&str] = &["STATUS", "status", "REAL_STATUS", "realStatus"];
pub const RESPONSIBLE_KEYS: &[&str] = &["RESPONSIBLE_ID", "responsibleId", "responsible_id"];
pub const CREATED_BY_KEYS: &[&str] = &["CREATED_BY", "createdBy", "created_by", "createdById"];
pub const CHANGED_DATE_KEYS: &[&str] = &["CHANGED_DATE", "changedDate"];

/// The comment webhook often reports `ID = 0`; the real id lives in one of these.
pub const COMMENT_ALT_ID_KEYS: &[&str] = &["MESSAGE_ID", "messageId", "COMMENT_ID", "commentId"];
pub const COMMENT_AUTHOR_KEYS: &[&str] = &["AUTHOR_ID", "authorId", "author_id"];
pub const COMMENT_TEXT_KEYS: &[&str] = &["POST_MESSAGE", "postMessage", "COMMENT_TEXT", "text"];
pub const COMMENT_DATE_KEYS: &[&str] = &["POST_DATE", "postDate"];

const TRACKED_KEY_SETS: &[&[&str]] = &[
    TITLE_KEYS,
    DEADLINE_KEYS,
    STATUS_KEYS,
    RESPONSIBLE_KEYS,
    CREATED_BY_KEYS,
];

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Raw value for the first candidate key present in `bag`.
pub fn lookup<'a>(bag: &'a FieldBag, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        if let Some(v) = bag.get(*key) {
            if !v.is_null() {
                return Some(v);
            }
        }
    }
    for key in keys {
        let folded = fold_key(key);
        if let Some((_, v)) = bag
            .iter()
            .find(|(k, v)| !v.is_null() && fold_key(k) == folded)
        {
            return Some(v);
        }
    }
    None
}

/// Text value of a logical field. Present-but-empty counts as absent.
pub fn text(bag: &FieldBag, keys: &[&str]) -> Option<String> {
    let raw = match lookup(bag, keys)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// Integer value of a logical field, accepting numeric strings.
pub fn int(bag: &FieldBag, keys: &[&str]) -> Option<i64> {
    match lookup(bag, keys)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Like [`int`], but `0` (the CRM's "nobody"/"unknown") counts as absent.
pub fn nonzero_id(bag: &FieldBag, keys: &[&str]) -> Option<i64> {
    int(bag, keys).filter(|id| *id != 0)
}

/// Whether the bag carries at least one tracked task field beyond identifiers.
pub fn carries_tracked_fields(bag: &FieldBag) -> bool {
    TRACKED_KEY_SETS.iter().any(|keys| text(bag, keys).is_some())
}

/// Comment id, preferring the alternate fields over the frequently-zero `ID`.
pub fn comment_id(bag: &FieldBag) -> Option<i64> {
    nonzero_id(bag, COMMENT_ALT_ID_KEYS).or_else(|| nonzero_id(bag, &["ID", "id"]))
}

impl TaskSnapshot {
    /// Build a snapshot from a CRM field bag. `None` when the bag has no task id.
    pub fn from_fields(bag: &FieldBag) -> Option<Self> {
        let task_id = nonzero_id(bag, ID_KEYS)?;
        Some(Self {
            task_id,
            title: text(bag, TITLE_KEYS).unwrap_or_default(),
            deadline: text(bag, DEADLINE_KEYS),
            status: text(bag, STATUS_KEYS),
            responsible_id: nonzero_id(bag, RESPONSIBLE_KEYS),
            created_by_id: nonzero_id(bag, CREATED_BY_KEYS),
            changed_date: text(bag, CHANGED_DATE_KEYS),
        })
    }

    /// Fill fields missing here from `fallback` (same task).
    pub fn merged_over(mut self, fallback: &TaskSnapshot) -> Self {
        if self.title.trim().is_empty() {
            self.title = fallback.title.clone();
        }
        self.deadline = self.deadline.or_else(|| fallback.deadline.clone());
        self.status = self.status.or_else(|| fallback.status.clone());
        self.responsible_id = self.responsible_id.or(fallback.responsible_id);
        self.created_by_id = self.created_by_id.or(fallback.created_by_id);
        self.changed_date = self.changed_date.or_else(|| fallback.changed_date.clone());
        self
    }
}
