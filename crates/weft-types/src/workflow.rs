//! Interactive resolution workflow records.
//!
//! A workflow is a non-domain entity: it has no position, is not part of the
//! simulated state, and ends either by explicit completion or by the
//! abandonment janitor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{InputShape, WorkflowStatus};
use crate::ids::{EntityId, WorkflowId};
use crate::intent::{ConditionFailure, WriteIntent};

/// Answer-field prefix that overrides a soft precondition.
pub const OVERRIDE_PREFIX: &str = "override.";
/// Answer-field prefix that substitutes a missing entity reference.
pub const SUBSTITUTE_PREFIX: &str = "substitute.";

/// Answer field overriding the precondition called `condition`.
pub fn override_field(condition: &str) -> String {
    format!("{OVERRIDE_PREFIX}{condition}")
}

/// Answer field substituting the target of the precondition called `condition`.
pub fn substitute_field(condition: &str) -> String {
    format!("{SUBSTITUTE_PREFIX}{condition}")
}

/// Answers collected from the human, keyed by request field.
pub type Answers = BTreeMap<String, serde_json::Value>;

/// A structured question put to the human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    /// Answer key the response must use.
    pub field: String,
    /// Human-readable prompt.
    pub prompt: String,
    /// Expected answer shape.
    pub shape: InputShape,
    /// Name of the precondition this request resolves.
    pub condition: String,
}

/// Draft plus everything collected so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// The intent waiting to commit.
    pub draft: WriteIntent,
    /// Accumulated answers.
    #[serde(default)]
    pub answers: Answers,
}

/// How a workflow ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowResult {
    /// The draft committed as `entity_id`.
    Committed {
        /// The committed entity.
        entity_id: EntityId,
    },
    /// The draft can never commit.
    Failed {
        /// Why.
        reason: String,
    },
    /// Abandoned.
    Cancelled {
        /// Who or what cancelled it.
        reason: String,
    },
}

/// A persisted resolution workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Workflow id.
    pub id: WorkflowId,
    /// What kind of negotiation this is (e.g. `relationship_proposal`).
    pub workflow_type: String,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Draft and answers.
    pub context: WorkflowContext,
    /// Outstanding input requests.
    pub requests: Vec<InputRequest>,
    /// Failures from the most recent check.
    pub failures: Vec<ConditionFailure>,
    /// Set once terminal.
    pub result: Option<WorkflowResult>,
    /// Creation time; the janitor ages workflows from here.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Open a new `Resolving` workflow.
    pub fn open(
        workflow_type: impl Into<String>,
        draft: WriteIntent,
        failures: Vec<ConditionFailure>,
        requests: Vec<InputRequest>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Resolving,
            context: WorkflowContext {
                draft,
                answers: Answers::new(),
            },
            requests,
            failures,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a terminal status with `result`. No-op when already terminal.
    pub fn finish(&mut self, status: WorkflowStatus, result: WorkflowResult) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = Some(result);
        self.requests.clear();
        self.updated_at = Utc::now();
        true
    }
}
