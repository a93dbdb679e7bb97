//! Status conditions shared by all kinds.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Upsert a condition by type.
///
/// Timestamps only move when something observable changed, so re-asserting an
/// identical condition leaves the status untouched. `last_transition_time`
/// moves only when the status flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    let now = Utc::now();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(c) => {
            if c.status == status && c.reason == reason && c.message == message {
                return;
            }
            if c.status != status {
                c.last_transition_time = Some(now);
            }
            c.status = status;
            c.reason = reason.to_string();
            c.message = message;
            c.last_update_time = Some(now);
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_update_time: Some(now),
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasserting_is_a_noop() {
        let mut conds = Vec::new();
        set(&mut conds, "Ready", ConditionStatus::True, "Ok", "fine");
        let before = conds.clone();
        set(&mut conds, "Ready", ConditionStatus::True, "Ok", "fine");
        assert_eq!(conds, before);
    }

    #[test]
    fn transition_time_moves_on_status_flip() {
        let mut conds = Vec::new();
        set(&mut conds, "Ready", ConditionStatus::False, "Missing", "no registry");
        conds[0].last_transition_time = None;
        set(&mut conds, "Ready", ConditionStatus::False, "Missing", "still no registry");
        assert!(conds[0].last_transition_time.is_none());
        set(&mut conds, "Ready", ConditionStatus::True, "Ok", "");
        assert!(conds[0].last_transition_time.is_some());
        assert_eq!(conds.len(), 1);
        assert_eq!(find(&conds, "Ready").map(|c| c.status), Some(ConditionStatus::True));
    }
}
