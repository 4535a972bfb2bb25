//! Error types for the commit service, checker and workflows.

use weft_db::DbError;
use weft_events::BusError;
use weft_types::{EntityId, EntityType, WorkflowId, WorkflowStatus};

use crate::config::ConfigError;

/// An intent or command that can never be accepted as written.
///
/// Raised before any I/O; nothing is stored and no workflow is opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A particle or wave with blank text.
    #[error("content text must not be empty")]
    EmptyText,

    /// A thread with a blank name.
    #[error("thread name must not be empty")]
    EmptyName,

    /// A bond whose two endpoints are the same entity.
    #[error("entity {0} cannot be related to itself")]
    SelfReference(EntityId),

    /// A bond or cardinality rule without a relationship kind.
    #[error("relationship kind must not be blank")]
    BlankRelationshipKind,

    /// A precondition without a name.
    #[error("precondition names must not be blank")]
    BlankConditionName,

    /// Two preconditions share a name, so answers would be ambiguous.
    #[error("duplicate precondition name '{0}'")]
    DuplicateCondition(String),

    /// A threshold bound that is NaN or infinite.
    #[error("precondition '{0}' has a non-finite bound")]
    NonFiniteBound(String),

    /// A cardinality limit of zero can never be satisfied.
    #[error("precondition '{0}' has a zero limit")]
    ZeroLimit(String),

    /// An update or transition without a target entity.
    #[error("{0} intents need an entity id")]
    MissingTarget(&'static str),

    /// An update that would change the entity's registry type.
    #[error("entity {entity_id} is a {registered}, not a {proposed}")]
    TypeChange {
        /// The entity.
        entity_id: EntityId,
        /// Type in the registry.
        registered: EntityType,
        /// Type implied by the new content.
        proposed: EntityType,
    },

    /// `SupplyInput` with no answers.
    #[error("no answers supplied")]
    EmptyAnswers,

    /// An answer key that no request uses.
    #[error("unknown answer field '{0}'")]
    UnknownAnswer(String),

    /// An answer whose value has the wrong shape.
    #[error("answer '{field}' is invalid: {reason}")]
    InvalidAnswer {
        /// The answer key.
        field: String,
        /// What was expected.
        reason: String,
    },
}

/// Errors surfaced by `weft-core`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The intent or command is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The durable store failed after retries.
    #[error("store failure: {0}")]
    Store(#[from] DbError),

    /// The bus failed.
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),

    /// The target entity does not exist.
    #[error("entity {0} not found")]
    NotFound(EntityId),

    /// No workflow with this id.
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// The workflow already reached a terminal status.
    #[error("workflow {id} is already {}", status.as_str())]
    WorkflowClosed {
        /// The workflow.
        id: WorkflowId,
        /// Its terminal status.
        status: WorkflowStatus,
    },

    /// Commit guards kept failing; the referenced state is changing faster
    /// than the intent can be re-checked.
    #[error("commit contention on entity {entity_id} after {attempts} attempts")]
    Contention {
        /// The entity whose guard failed last.
        entity_id: EntityId,
        /// Checks performed.
        attempts: u32,
    },

    /// A batched snapshot read failed.
    #[error("precondition snapshot failed: {reason}")]
    Snapshot {
        /// Whether the underlying store error was transient.
        transient: bool,
        /// The store error.
        reason: String,
    },

    /// The check batcher task is gone.
    #[error("precondition checker is not running")]
    CheckerStopped,

    /// An intent tried an illegal state transition.
    #[error("illegal intent transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state.
        from: weft_types::IntentState,
        /// Requested state.
        to: weft_types::IntentState,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Whether the caller may retry the same command.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Bus(e) => e.is_transient(),
            Self::Snapshot { transient, .. } => *transient,
            Self::Contention { .. } => true,
            _ => false,
        }
    }
}
