//! Intent and command validation.
//!
//! Validation runs before any I/O and in three stages:
//! 1. Content -- is the draft payload well-formed?
//! 2. Target -- does the operation name the entity it changes?
//! 3. Preconditions -- are names unique and parameters satisfiable?
//!
//! Each stage returns `Ok(())` or the first [`ValidationError`] it finds.
//! A failure rejects the intent outright; no workflow is opened.

use std::collections::BTreeSet;

use weft_types::workflow::{OVERRIDE_PREFIX, SUBSTITUTE_PREFIX};
use weft_types::{
    Answers, ConditionType, EntityContent, EntityId, OperationType, Precondition, WriteIntent,
};

use crate::error::ValidationError;

/// Validate an intent through the full pipeline.
pub fn validate_intent(intent: &WriteIntent) -> Result<(), ValidationError> {
    validate_content(&intent.draft)?;
    validate_target(intent.operation, intent.entity_id)?;
    validate_preconditions(&intent.preconditions)
}

/// Stage 1: the draft payload.
pub fn validate_content(content: &EntityContent) -> Result<(), ValidationError> {
    match content {
        EntityContent::Particle { text, .. } | EntityContent::Wave { text, .. } => {
            if text.trim().is_empty() {
                return Err(ValidationError::EmptyText);
            }
        }
        EntityContent::Thread { name, .. } => {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyName);
            }
        }
        EntityContent::Bond {
            endpoints: [a, b],
            kind,
            ..
        } => {
            if a == b {
                return Err(ValidationError::SelfReference(*a));
            }
            if kind.as_str().trim().is_empty() {
                return Err(ValidationError::BlankRelationshipKind);
            }
        }
    }
    Ok(())
}

/// Stage 2: updates and transitions must name their entity.
const fn validate_target(
    operation: OperationType,
    entity_id: Option<EntityId>,
) -> Result<(), ValidationError> {
    match (operation, entity_id) {
        (OperationType::Update, None) => Err(ValidationError::MissingTarget("update")),
        (OperationType::TransitionState, None) => {
            Err(ValidationError::MissingTarget("transition_state"))
        }
        _ => Ok(()),
    }
}

/// Stage 3: precondition names and parameters.
pub fn validate_preconditions(preconditions: &[Precondition]) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for p in preconditions {
        if p.name.trim().is_empty() {
            return Err(ValidationError::BlankConditionName);
        }
        if !seen.insert(p.name.as_str()) {
            return Err(ValidationError::DuplicateCondition(p.name.clone()));
        }
        match &p.condition {
            ConditionType::Threshold { bound, .. } if !bound.is_finite() => {
                return Err(ValidationError::NonFiniteBound(p.name.clone()));
            }
            ConditionType::Cardinality { limit: 0, .. } => {
                return Err(ValidationError::ZeroLimit(p.name.clone()));
            }
            ConditionType::Cardinality { kind, .. } if kind.as_str().trim().is_empty() => {
                return Err(ValidationError::BlankRelationshipKind);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check the shape of answers supplied to a workflow.
///
/// `override.<name>` must be a boolean and `substitute.<name>` a UUID string,
/// where `<name>` is one of the draft's preconditions.
pub fn validate_answers(answers: &Answers, draft: &WriteIntent) -> Result<(), ValidationError> {
    if answers.is_empty() {
        return Err(ValidationError::EmptyAnswers);
    }
    let known = |name: &str| draft.preconditions.iter().any(|p| p.name == name);

    for (field, value) in answers {
        if let Some(name) = field.strip_prefix(OVERRIDE_PREFIX) {
            if !known(name) {
                return Err(ValidationError::UnknownAnswer(field.clone()));
            }
            if !value.is_boolean() {
                return Err(ValidationError::InvalidAnswer {
                    field: field.clone(),
                    reason: "expected true or false".to_owned(),
                });
            }
        } else if let Some(name) = field.strip_prefix(SUBSTITUTE_PREFIX) {
            if !known(name) {
                return Err(ValidationError::UnknownAnswer(field.clone()));
            }
            parse_entity_ref(field, value)?;
        } else {
            return Err(ValidationError::UnknownAnswer(field.clone()));
        }
    }
    Ok(())
}

/// Read an entity reference answer.
pub fn parse_entity_ref(
    field: &str,
    value: &serde_json::Value,
) -> Result<EntityId, ValidationError> {
    value
        .as_str()
        .and_then(|s| s.parse::<EntityId>().ok())
        .ok_or_else(|| ValidationError::InvalidAnswer {
            field: field.to_owned(),
            reason: "expected an entity id".to_owned(),
        })
}
