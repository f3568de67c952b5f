//! Status conditions.
//!
//! Conditions are the only user-visible failure surface. Setting a condition
//! to the value it already holds is a no-op, so status comparisons stay
//! stable across redundant reconciles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Known condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Revision is the one served for its node.
    RevisionPublished,
    /// Revision resources are materialized in the snapshot cache.
    ResourcesInSync,
    /// Revision must not be (re-)published.
    RevisionTainted,
    /// Request is served from a revision other than the desired one, or none.
    CacheOutOfSync,
    /// No untainted revision remains for the request.
    RollbackFailed,
}

/// A single condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Ordered set of conditions, at most one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Look up a condition.
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// True when the condition is present and true.
    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type).is_some_and(|c| c.status)
    }

    /// Set a condition.
    ///
    /// Returns true if anything changed. The transition time moves only
    /// when `status` flips or the condition is new.
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.0.iter_mut().find(|c| c.condition_type == condition_type) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.0.push(Condition {
                    condition_type,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// Remove a condition. Returns true if it was present.
    pub fn remove(&mut self, condition_type: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.condition_type != condition_type);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn set_is_idempotent() {
        let mut conditions = Conditions::new();
        assert!(conditions.set(ConditionType::RevisionTainted, true, "Nack", "bad", at(1)));
        assert!(!conditions.set(ConditionType::RevisionTainted, true, "Nack", "bad", at(2)));
        assert_eq!(
            conditions
                .get(ConditionType::RevisionTainted)
                .unwrap()
                .last_transition_time,
            at(1)
        );
    }

    #[test]
    fn transition_time_moves_on_flip_only() {
        let mut conditions = Conditions::new();
        conditions.set(ConditionType::ResourcesInSync, false, "A", "", at(1));
        conditions.set(ConditionType::ResourcesInSync, false, "B", "", at(2));
        assert_eq!(
            conditions
                .get(ConditionType::ResourcesInSync)
                .unwrap()
                .last_transition_time,
            at(1)
        );
        conditions.set(ConditionType::ResourcesInSync, true, "B", "", at(3));
        let c = conditions.get(ConditionType::ResourcesInSync).unwrap();
        assert!(c.status);
        assert_eq!(c.last_transition_time, at(3));
    }

    #[test]
    fn remove() {
        let mut conditions = Conditions::new();
        conditions.set(ConditionType::RollbackFailed, true, "", "", at(1));
        assert!(conditions.remove(ConditionType::RollbackFailed));
        assert!(!conditions.remove(ConditionType::RollbackFailed));
        assert!(conditions.is_empty());
    }
}
