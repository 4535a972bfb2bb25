//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] errors and adds the store-level conditions the commit protocol
//! reacts to (duplicate versions, failed commit guards, closed workflows).

use weft_types::{EntityId, WorkflowId, WorkflowStatus};

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `(entity_id, version_number)` already exists in the semantic log.
    #[error("duplicate version {version_number} for entity {entity_id}")]
    DuplicateVersion {
        /// The entity.
        entity_id: EntityId,
        /// The version that already exists.
        version_number: u64,
    },

    /// The entity is already registered.
    #[error("entity {0} is already registered")]
    DuplicateEntity(EntityId),

    /// The entity is not registered.
    #[error("entity {0} not found")]
    NotFound(EntityId),

    /// A commit guard no longer holds; nothing was written.
    #[error("commit guard failed for entity {entity_id}: {detail}")]
    GuardFailed {
        /// The guarded entity.
        entity_id: EntityId,
        /// What changed since the snapshot.
        detail: String,
    },

    /// No workflow record with this id.
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// The stored workflow is no longer `Resolving`; nothing was written.
    #[error("workflow {id} is already {}", status.as_str())]
    WorkflowClosed {
        /// The workflow.
        id: WorkflowId,
        /// Its stored terminal status.
        status: WorkflowStatus,
    },

    /// A stored value could not be mapped back to the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Postgres(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}
