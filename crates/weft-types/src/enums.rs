//! Enumeration types shared across the workspace.
//!
//! Closed sets only: entity categories, intent operations, comparison
//! operators, workflow and intent lifecycle states.

use serde::{Deserialize, Serialize};

/// The fixed set of domain entity types recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A discrete event: what happened.
    Moment,
    /// An internal state snapshot: how it felt.
    Pulse,
    /// A future-oriented task or goal.
    Intent,
    /// A person, place, topic or concept being tracked.
    Thread,
    /// A relationship between two entities.
    Bond,
    /// A recurring external pattern.
    Motif,
    /// A recurring internal pattern.
    Filament,
    /// An active thematic goal.
    Focus,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Moment,
        Self::Pulse,
        Self::Intent,
        Self::Thread,
        Self::Bond,
        Self::Motif,
        Self::Filament,
        Self::Focus,
    ];

    /// The tag stored in the registry's `entity_type` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Moment => "moment",
            Self::Pulse => "pulse",
            Self::Intent => "intent",
            Self::Thread => "thread",
            Self::Bond => "bond",
            Self::Motif => "motif",
            Self::Filament => "filament",
            Self::Focus => "focus",
        }
    }

    /// Parse a registry tag back into an entity type.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Particle-category entity types (discrete occurrences).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleKind {
    /// See [`EntityType::Moment`].
    Moment,
    /// See [`EntityType::Pulse`].
    Pulse,
    /// See [`EntityType::Intent`].
    Intent,
}

/// Wave-category entity types (recurring patterns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveKind {
    /// See [`EntityType::Motif`].
    Motif,
    /// See [`EntityType::Filament`].
    Filament,
    /// See [`EntityType::Focus`].
    Focus,
}

/// What a [`WriteIntent`](crate::WriteIntent) asks the commit service to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Register a new entity and write its first version.
    Create,
    /// Append a new semantic version to an existing entity.
    Update,
    /// Append a version whose only change is a lifecycle field.
    TransitionState,
}

/// Comparison operator for numeric threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// `value < bound`
    Lt,
    /// `value <= bound`
    Le,
    /// `value > bound`
    Gt,
    /// `value >= bound`
    Ge,
}

impl Comparator {
    /// Evaluate `value <op> bound`. NaN never satisfies a comparison.
    pub fn holds(self, value: f64, bound: f64) -> bool {
        match self {
            Self::Lt => value < bound,
            Self::Le => value <= bound,
            Self::Gt => value > bound,
            Self::Ge => value >= bound,
        }
    }

    /// Operator symbol used in human-readable failure reasons.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// How strictly a failing precondition blocks a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Failure blocks the intent; no human input can lift it.
    #[default]
    Hard,
    /// Failure can be lifted by an explicit override answer.
    Soft,
}

/// Lifecycle status of an interactive resolution workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Waiting for human input.
    Resolving,
    /// The draft committed.
    Completed,
    /// The draft can never commit.
    Failed,
    /// Abandoned by the caller or reclaimed by the janitor.
    Cancelled,
}

impl WorkflowStatus {
    /// The tag stored in the `workflows.status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "resolving" => Some(Self::Resolving),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Resolving)
    }
}

/// The kind of value an input request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    /// A yes/no confirmation.
    Confirm,
    /// The id of an existing entity.
    EntityRef,
    /// Free text.
    Text,
    /// A number.
    Number,
}

/// Per-intent commit state machine.
///
/// ```text
/// Received -> FastPathCommitted
/// Received -> Checking -> Committed
///                      -> AwaitingInput -> Checking (on new input)
///                      -> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    /// Accepted for processing, nothing evaluated yet.
    Received,
    /// Written without preconditions; derived state follows asynchronously.
    FastPathCommitted,
    /// Preconditions are being evaluated.
    Checking,
    /// Committed transactionally after all preconditions passed.
    Committed,
    /// Parked in a resolution workflow.
    AwaitingInput,
    /// Will never commit.
    Rejected,
}

impl IntentState {
    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::FastPathCommitted | Self::Checking | Self::Rejected)
                | (Self::Checking, Self::Committed | Self::AwaitingInput | Self::Rejected)
                | (Self::AwaitingInput, Self::Checking | Self::Rejected)
        )
    }

    /// Whether the intent has reached a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::FastPathCommitted | Self::Committed | Self::Rejected)
    }
}
