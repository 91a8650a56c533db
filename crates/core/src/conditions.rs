//! Condition bookkeeping. Conditions are the only state machine the engine
//! has: a named boolean with reason/message, keyed by type, whose transition
//! time advances only when the truth value flips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition signalling the object has converged and is usable.
pub const READY: &str = "Ready";
/// Terminal condition for one-shot work (builds): present once finished.
pub const SUCCEEDED: &str = "Succeeded";
/// Progress condition while a build is running.
pub const STAGING: &str = "Staging";
/// Designated terminal-failure condition; true means no amount of requeueing
/// will help without a new generation.
pub const FAILED: &str = "Failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
            observed_generation: 0,
        }
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).map(|c| c.status).unwrap_or(false)
}

/// Insert or update a condition keyed by type. The transition time is kept
/// from the previous entry unless the truth value flipped, so callers get a
/// monotonic "did anything change" signal without churn.
pub fn set(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time;
            }
            *existing = next;
        }
        None => conditions.push(next),
    }
}
