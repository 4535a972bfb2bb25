//! Caller-facing commands handled by the commit service, and their replies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityContent, Fields, RelationshipKind};
use crate::ids::{EntityId, WorkflowId};
use crate::intent::{ConditionFailure, IntentMetadata, Precondition};
use crate::workflow::{Answers, InputRequest};

/// Create a new entity, optionally guarded by preconditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntity {
    /// Semantic payload of the first version.
    pub content: EntityContent,
    /// Conditions; empty selects the fast path.
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    /// Logical time; defaults to now.
    #[serde(default)]
    pub effective_at: Option<DateTime<Utc>>,
    /// Provenance.
    #[serde(default)]
    pub metadata: IntentMetadata,
}

/// Append a new version to an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntity {
    /// The entity to update.
    pub entity_id: EntityId,
    /// The new semantic payload.
    pub content: EntityContent,
    /// Why.
    pub change_reason: String,
    /// Conditions; empty selects the fast path.
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
}

/// Outcome of [`CreateEntity`] / [`UpdateEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Durable; derived state may still be pending.
    Accepted,
    /// A precondition needs human input.
    AwaitingInput,
    /// Will never commit.
    Rejected,
}

/// Reply to [`CreateEntity`] / [`UpdateEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// The entity id, when accepted.
    pub id: Option<EntityId>,
    /// Outcome.
    pub status: WriteStatus,
    /// Workflow to answer, when awaiting input.
    pub workflow_id: Option<WorkflowId>,
    /// Questions for the human.
    pub required_input: Vec<InputRequest>,
    /// Failing conditions, in precondition order.
    pub failures: Vec<ConditionFailure>,
}

/// Propose a relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeRelationship {
    /// The two entities.
    pub endpoints: [EntityId; 2],
    /// Relationship class.
    pub kind: RelationshipKind,
    /// Extra fields on the Bond content.
    #[serde(default)]
    pub fields: Fields,
}

/// Outcome of [`ProposeRelationship`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposeStatus {
    /// The Bond committed.
    Created,
    /// A precondition needs human input.
    AwaitingInput,
    /// Will never commit.
    Rejected,
}

/// Reply to [`ProposeRelationship`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// Outcome.
    pub status: ProposeStatus,
    /// The Bond entity id, when created.
    pub relationship_id: Option<EntityId>,
    /// Workflow to answer, when awaiting input.
    pub workflow_id: Option<WorkflowId>,
    /// Questions for the human.
    pub required_input: Vec<InputRequest>,
    /// Failing conditions, in precondition order.
    pub failures: Vec<ConditionFailure>,
}

/// Answer outstanding requests of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyInput {
    /// The workflow being answered.
    pub workflow_id: WorkflowId,
    /// Answers keyed by request field.
    pub answers: Answers,
}

/// Outcome of [`SupplyInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyStatus {
    /// Still resolving; see `required_input`.
    Continuing,
    /// The draft committed.
    Created,
    /// The draft can never commit.
    Failed,
}

/// Reply to [`SupplyInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyInputResponse {
    /// Outcome.
    pub status: SupplyStatus,
    /// The workflow.
    pub workflow_id: WorkflowId,
    /// The committed entity, when created.
    pub entity_id: Option<EntityId>,
    /// Remaining questions.
    pub required_input: Vec<InputRequest>,
    /// Remaining failures.
    pub failures: Vec<ConditionFailure>,
}

/// Retire an entity; its cached node is removed once the tombstone lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetireEntity {
    /// The entity to retire.
    pub entity_id: EntityId,
    /// Recorded as the change reason of the retiring version.
    #[serde(default)]
    pub reason: String,
}

/// Abandon a workflow that is still resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelWorkflow {
    /// The workflow to cancel.
    pub workflow_id: WorkflowId,
    /// Recorded as the workflow result.
    #[serde(default)]
    pub reason: String,
}
