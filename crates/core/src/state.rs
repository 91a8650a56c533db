//! State and last-operation derivation. Implemented once so the condition
//! grid is interpreted identically everywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Condition, FAILED, READY, SUCCEEDED};
use crate::ObjectMeta;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceState {
    Initial,
    InProgress,
    Succeeded,
    Failed,
    Deleting,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationState {
    #[serde(rename = "initial")]
    Initial,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

/// Simplified operation-progress view for client polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Derive the object's lifecycle state from its condition set.
///
/// Precedence: a pending deletion overrides everything; the designated
/// failure condition is terminal; Ready or Succeeded being true means
/// converged; any other observed condition means work is in flight; no
/// conditions at all means the controller has not looked yet.
pub fn derive_state(
    conditions: &[Condition],
    deletion_timestamp: Option<&DateTime<Utc>>,
) -> ResourceState {
    if deletion_timestamp.is_some() {
        return ResourceState::Deleting;
    }
    if conditions::is_true(conditions, FAILED) {
        return ResourceState::Failed;
    }
    if conditions::is_true(conditions, READY) || conditions::is_true(conditions, SUCCEEDED) {
        return ResourceState::Succeeded;
    }
    if conditions.is_empty() {
        return ResourceState::Initial;
    }
    ResourceState::InProgress
}

/// Collapse state plus metadata into the polling view. Deletion forces
/// `type=delete` regardless of what the conditions say.
pub fn last_operation(meta: &ObjectMeta, conditions: &[Condition]) -> LastOperation {
    let updated_at = last_transition(conditions);

    if let Some(deleted_at) = meta.deletion_timestamp {
        return LastOperation {
            op_type: OperationType::Delete,
            state: OperationState::InProgress,
            description: None,
            created_at: deleted_at,
            updated_at,
        };
    }

    let (state, description) = match derive_state(conditions, None) {
        ResourceState::Initial => (OperationState::Initial, None),
        ResourceState::InProgress => (OperationState::InProgress, None),
        ResourceState::Succeeded => (OperationState::Succeeded, None),
        ResourceState::Failed => (
            OperationState::Failed,
            conditions::find(conditions, FAILED).map(|c| c.message.clone()),
        ),
        // Unreachable: deletion handled above.
        ResourceState::Deleting => (OperationState::InProgress, None),
    };

    LastOperation {
        op_type: OperationType::Create,
        state,
        description,
        created_at: meta.created_at,
        updated_at,
    }
}

fn last_transition(conditions: &[Condition]) -> Option<DateTime<Utc>> {
    conditions.iter().map(|c| c.last_transition_time).max()
}
