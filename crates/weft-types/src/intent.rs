//! Write intents, preconditions and structured precondition failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityContent, RelationshipKind};
use crate::enums::{Comparator, Enforcement, OperationType};
use crate::ids::EntityId;

/// A declarative request to create or change an entity, paired with the
/// conditions that must hold for it to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteIntent {
    /// What kind of write this is.
    pub operation: OperationType,
    /// Target entity. `None` for [`OperationType::Create`]; the commit
    /// service assigns the id.
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    /// Draft semantic payload.
    pub draft: EntityContent,
    /// Logical time of the content; defaults to commit time.
    #[serde(default)]
    pub effective_at: Option<DateTime<Utc>>,
    /// Why the write is being made.
    #[serde(default)]
    pub change_reason: String,
    /// Ordered conditions; all must hold against one snapshot.
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    /// Provenance.
    #[serde(default)]
    pub metadata: IntentMetadata,
}

impl WriteIntent {
    /// A create intent with no preconditions.
    pub fn create(draft: EntityContent) -> Self {
        Self {
            operation: OperationType::Create,
            entity_id: None,
            draft,
            effective_at: None,
            change_reason: "created".to_owned(),
            preconditions: Vec::new(),
            metadata: IntentMetadata::default(),
        }
    }

    /// Attach a precondition.
    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    /// Every entity id referenced by a precondition, in first-seen order.
    pub fn referenced_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = Vec::with_capacity(self.preconditions.len());
        for p in &self.preconditions {
            if !ids.contains(&p.target) {
                ids.push(p.target);
            }
        }
        ids
    }
}

/// Provenance attached to an intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    /// Where the intent came from (e.g. `"weave"`, `"import"`).
    #[serde(default)]
    pub source: String,
    /// Related entity ids, informational only.
    #[serde(default)]
    pub related_ids: Vec<EntityId>,
    /// Optional classification metadata forwarded to the physics processor.
    #[serde(default)]
    pub classification: Option<serde_json::Value>,
}

/// One verifiable, named condition over entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    /// Stable name, unique within an intent. Answers refer to it.
    pub name: String,
    /// The entity the condition is evaluated against.
    pub target: EntityId,
    /// What is checked.
    pub condition: ConditionType,
    /// Whether a failure can be overridden.
    #[serde(default)]
    pub enforcement: Enforcement,
}

impl Precondition {
    /// `target` must exist.
    pub fn exists(name: impl Into<String>, target: EntityId) -> Self {
        Self {
            name: name.into(),
            target,
            condition: ConditionType::Exists,
            enforcement: Enforcement::Hard,
        }
    }

    /// `target`'s current semantic `field` must equal `expected`.
    pub fn lifecycle(
        name: impl Into<String>,
        target: EntityId,
        field: impl Into<String>,
        expected: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            condition: ConditionType::LifecycleState {
                field: field.into(),
                expected,
            },
            enforcement: Enforcement::Hard,
        }
    }

    /// `target`'s derived `field` must satisfy `comparator bound`.
    pub fn threshold(
        name: impl Into<String>,
        target: EntityId,
        field: impl Into<String>,
        comparator: Comparator,
        bound: f64,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            condition: ConditionType::Threshold {
                field: field.into(),
                comparator,
                bound,
            },
            enforcement: Enforcement::Hard,
        }
    }

    /// `target` must hold fewer than `limit` relationships of `kind`.
    pub fn cardinality(
        name: impl Into<String>,
        target: EntityId,
        kind: RelationshipKind,
        limit: u32,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            condition: ConditionType::Cardinality { kind, limit },
            enforcement: Enforcement::Hard,
        }
    }

    /// Set the enforcement level.
    #[must_use]
    pub const fn with_enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = enforcement;
        self
    }
}

/// What a precondition checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionType {
    /// The target resolves in the snapshot.
    Exists,
    /// A named field of the current semantic version equals `expected`.
    LifecycleState {
        /// Field name on the semantic content.
        field: String,
        /// Required value.
        expected: serde_json::Value,
    },
    /// A named derived scalar satisfies `comparator bound`.
    Threshold {
        /// Scalar name on the derived payload.
        field: String,
        /// Comparison operator.
        comparator: Comparator,
        /// Bound to compare against.
        bound: f64,
    },
    /// The target's active relationship count of `kind` is below `limit`.
    Cardinality {
        /// Relationship class being counted.
        kind: RelationshipKind,
        /// Maximum number of relationships allowed.
        limit: u32,
    },
}

/// A precondition that did not hold, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionFailure {
    /// Name of the failing precondition.
    pub name: String,
    /// Its target.
    pub target: EntityId,
    /// Its enforcement level.
    pub enforcement: Enforcement,
    /// Why it failed.
    pub reason: FailureReason,
}

impl ConditionFailure {
    /// Human-readable description of the failure.
    pub fn describe(&self) -> String {
        format!("{} on {}: {}", self.name, self.target, self.reason)
    }
}

/// Structured cause of a [`ConditionFailure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The target does not exist.
    Missing,
    /// The lifecycle field has a different value.
    StateMismatch {
        /// Required value.
        expected: serde_json::Value,
        /// Actual value, if the field is present.
        found: Option<serde_json::Value>,
    },
    /// The named derived field is absent or not numeric.
    FieldAbsent {
        /// The field that was looked up.
        field: String,
    },
    /// The derived field does not satisfy the bound.
    ThresholdNotMet {
        /// Observed value.
        value: f64,
        /// Operator.
        comparator: Comparator,
        /// Bound.
        bound: f64,
    },
    /// The relationship count already reached the limit.
    LimitReached {
        /// Relationship class.
        kind: RelationshipKind,
        /// Existing count.
        count: u32,
        /// Configured limit.
        limit: u32,
    },
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Missing => f.write_str("entity does not exist"),
            Self::StateMismatch { expected, found } => match found {
                Some(found) => write!(f, "expected {expected}, found {found}"),
                None => write!(f, "expected {expected}, field not set"),
            },
            Self::FieldAbsent { field } => write!(f, "derived field '{field}' is not available"),
            Self::ThresholdNotMet {
                value,
                comparator,
                bound,
            } => write!(f, "{value} {} {bound} does not hold", comparator.symbol()),
            Self::LimitReached { kind, count, limit } => {
                write!(f, "already holds {count} '{kind}' relationship(s), limit {limit}")
            }
        }
    }
}
