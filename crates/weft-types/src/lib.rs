//! Shared type definitions for the Weft semantic store.
//!
//! This crate is the single source of truth for the data model shared by
//! the durable store, the event bus, the spatial cache and the commit
//! service.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers and partition assignment
//! - [`enums`] -- Entity types, comparators, workflow and intent states
//! - [`entity`] -- Registry, semantic-log and derived-state records
//! - [`intent`] -- Write intents, preconditions and failures
//! - [`events`] -- Bus topics, payloads and the wire envelope
//! - [`workflow`] -- Interactive resolution workflow records
//! - [`commands`] -- Caller-facing commands and replies
//! - [`retry`] -- Bounded exponential backoff

pub mod commands;
pub mod entity;
pub mod enums;
pub mod events;
pub mod ids;
pub mod intent;
pub mod retry;
pub mod workflow;

// Re-export all public types at crate root for convenience.
pub use commands::{
    CancelWorkflow, CreateEntity, ProposeRelationship, ProposeResponse, ProposeStatus, RetireEntity,
    SupplyInput, SupplyInputResponse, SupplyStatus, UpdateEntity, WriteResponse, WriteStatus,
};
pub use entity::{
    Coordinates, DerivedPayload, DerivedState, EntityContent, EntityView, Fields,
    RETIRED_STATUS, RegistryRecord, RelationshipKind, STATUS_FIELD, SemanticVersion,
};
pub use enums::{
    Comparator, Enforcement, EntityType, InputShape, IntentState, OperationType, ParticleKind,
    WaveKind, WorkflowStatus,
};
pub use events::{
    DecodeError, DerivedCompleted, DomainEvent, EntityProcess, EntityTombstoned, EventEnvelope,
    RelationshipCreated,
};
pub use ids::{EntityId, EventId, Partition, WorkflowId};
pub use intent::{
    ConditionFailure, ConditionType, FailureReason, IntentMetadata, Precondition, WriteIntent,
};
pub use retry::RetryPolicy;
pub use workflow::{Answers, InputRequest, WorkflowContext, WorkflowRecord, WorkflowResult};
