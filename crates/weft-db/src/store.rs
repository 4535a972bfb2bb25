//! The durable store port.
//!
//! [`DurableStore`] is the single seam between the commit protocol and
//! persistence. Two adapters implement it: [`PgStore`](crate::PgStore) for
//! `PostgreSQL` and [`MemoryStore`](crate::MemoryStore) for in-process runs
//! and tests.
//!
//! # Relations
//!
//! | Relation | Mutability | Key |
//! |----------|------------|-----|
//! | `registry` | append-only | `entity_id` |
//! | `semantic_log` | append-only | `(entity_id, version_number)` |
//! | `derived_state` | upsert | `entity_id` |
//! | `workflows` | compare-and-set while `resolving` | `workflow_id` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use weft_types::{
    Coordinates, DerivedState, EntityContent, EntityId, EntityView, Partition, RegistryRecord,
    RelationshipKind, SemanticVersion, WorkflowId, WorkflowRecord,
};

use crate::error::DbError;

/// Active relationship counts keyed by `(entity, kind)`.
pub type TallyMap = BTreeMap<(EntityId, RelationshipKind), u32>;

/// What [`DurableStore::upsert_derived_state`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed; one was inserted.
    Inserted,
    /// An older (or equal-version, different-content) row was replaced.
    Replaced,
    /// An identical row already existed; nothing changed.
    Unchanged,
    /// A newer row already existed; the write was ignored.
    Stale,
}

impl UpsertOutcome {
    /// Decide the outcome of writing `incoming` over `existing`.
    ///
    /// Higher versions win; equal versions are last-write-wins in arrival
    /// order, and an identical payload is a no-op.
    pub fn decide(existing: Option<&DerivedState>, incoming: &DerivedState) -> Self {
        match existing {
            None => Self::Inserted,
            Some(current) if current.version_number > incoming.version_number => Self::Stale,
            Some(current)
                if current.version_number == incoming.version_number
                    && current.payload == incoming.payload =>
            {
                Self::Unchanged
            }
            Some(_) => Self::Replaced,
        }
    }

    /// Whether the stored row now equals `incoming`.
    pub const fn applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced | Self::Unchanged)
    }
}

/// Axis-aligned box in simulation space (inclusive bounds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateRange {
    /// Lower corner.
    pub min: Coordinates,
    /// Upper corner.
    pub max: Coordinates,
}

impl CoordinateRange {
    /// Whether `point` lies inside the box.
    pub fn contains(&self, point: &Coordinates) -> bool {
        point
            .0
            .iter()
            .zip(self.min.0.iter().zip(self.max.0.iter()))
            .all(|(v, (lo, hi))| v >= lo && v <= hi)
    }
}

/// Predicate for [`DurableStore::bulk_read_derived`].
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFilter {
    /// Only rows whose entity falls into this partition.
    pub partition: Partition,
    /// Only rows with a position inside this box.
    pub bounds: Option<CoordinateRange>,
}

impl DerivedFilter {
    /// Every derived row.
    pub const ALL: Self = Self {
        partition: Partition::ALL,
        bounds: None,
    };

    /// Whether `state` passes the filter.
    pub fn matches(&self, state: &DerivedState) -> bool {
        if !self.partition.contains(&state.entity_id) {
            return false;
        }
        match (&self.bounds, &state.payload.position) {
            (None, _) => true,
            (Some(bounds), Some(position)) => bounds.contains(position),
            (Some(_), None) => false,
        }
    }
}

/// A condition re-verified inside the commit transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitGuard {
    /// The entity's current semantic version must still be `expected`
    /// (0 = no version / not registered).
    Version {
        /// The guarded entity.
        entity_id: EntityId,
        /// Version observed in the snapshot.
        expected: u64,
    },
    /// The entity's active relationship count of `kind` must still be `expected`.
    Tally {
        /// The guarded entity.
        entity_id: EntityId,
        /// Relationship class.
        kind: RelationshipKind,
        /// Count observed in the snapshot.
        expected: u32,
    },
}

impl CommitGuard {
    /// The entity this guard protects.
    pub const fn entity_id(&self) -> EntityId {
        match self {
            Self::Version { entity_id, .. } | Self::Tally { entity_id, .. } => *entity_id,
        }
    }
}

/// Everything one intent writes, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    /// Registry row for creates; `None` for updates.
    pub registry: Option<RegistryRecord>,
    /// The new semantic version.
    pub version: SemanticVersion,
    /// Derived state written in the same transaction, if any.
    pub derived: Option<DerivedState>,
    /// Conditions that must still hold at write time.
    pub guards: Vec<CommitGuard>,
    /// Workflow record closed by this commit. The stored record must still
    /// be `Resolving`, otherwise nothing is written.
    pub workflow: Option<WorkflowRecord>,
}

/// One consistent read over a set of entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Views of the requested entities that exist.
    pub entities: BTreeMap<EntityId, EntityView>,
    /// Active relationship tallies for the requested entities (zero counts omitted).
    pub tallies: TallyMap,
}

impl StoreSnapshot {
    /// Tally for `(entity, kind)`, zero when absent.
    pub fn tally(&self, entity_id: EntityId, kind: &RelationshipKind) -> u32 {
        self.tallies
            .get(&(entity_id, kind.clone()))
            .copied()
            .unwrap_or(0)
    }
}

/// Count active relationships touching any of `ids` from current bond contents.
pub fn count_tallies<'a>(
    current_bonds: impl Iterator<Item = &'a EntityContent>,
    ids: &[EntityId],
) -> TallyMap {
    let mut tallies = TallyMap::new();
    for content in current_bonds {
        if content.is_retired() {
            continue;
        }
        let Some((endpoints, kind)) = content.bond() else {
            continue;
        };
        for endpoint in endpoints {
            if ids.contains(endpoint) {
                let slot = tallies.entry((*endpoint, kind.clone())).or_insert(0);
                *slot = slot.saturating_add(1);
            }
        }
    }
    tallies
}

/// Durable store operations used by the commit protocol, the physics
/// processor host and cache hydration.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a registry row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateEntity`] if the id is taken.
    async fn register_entity(&self, record: &RegistryRecord) -> Result<(), DbError>;

    /// Append a semantic version.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateVersion`] if `(entity_id, version_number)`
    /// exists, which callers use to detect idempotent replays, and
    /// [`DbError::NotFound`] if the entity is not registered.
    async fn append_version(&self, version: &SemanticVersion) -> Result<(), DbError>;

    /// Upsert derived state with monotonic version compare.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the entity is not registered.
    async fn upsert_derived_state(&self, state: &DerivedState) -> Result<UpsertOutcome, DbError>;

    /// Read one entity.
    async fn point_read(&self, entity_id: EntityId) -> Result<Option<EntityView>, DbError>;

    /// Read every derived row passing `filter`.
    async fn bulk_read_derived(&self, filter: &DerivedFilter)
    -> Result<Vec<DerivedState>, DbError>;

    /// Read views and relationship tallies for `ids` in one consistent snapshot.
    async fn read_snapshot(&self, ids: &[EntityId]) -> Result<StoreSnapshot, DbError>;

    /// Active relationship tallies per `(entity, kind)` for `ids`.
    async fn relationship_tallies(&self, ids: &[EntityId]) -> Result<TallyMap, DbError>;

    /// Re-verify `batch.guards` and write the batch atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::GuardFailed`], [`DbError::DuplicateEntity`],
    /// [`DbError::DuplicateVersion`] or [`DbError::WorkflowClosed`] without
    /// writing anything.
    async fn commit_atomic(&self, batch: &CommitBatch) -> Result<(), DbError>;

    /// Every semantic version of an entity, oldest first.
    async fn version_history(&self, entity_id: EntityId) -> Result<Vec<SemanticVersion>, DbError>;

    /// Insert or replace a workflow record.
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError>;

    /// Replace a workflow record only while the stored one is `Resolving`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::WorkflowClosed`] if another writer closed it first,
    /// or [`DbError::WorkflowNotFound`].
    async fn advance_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError>;

    /// Load a workflow record.
    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, DbError>;

    /// Workflows still `Resolving` that were created before `cutoff`.
    async fn resolving_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, DbError>;
}

#[cfg(test)]
mod tests {
    use weft_types::{DerivedPayload, Fields};

    use super::*;

    fn derived(version_number: u64, energy: f64) -> DerivedState {
        let mut payload = DerivedPayload::default();
        payload.scalars.insert("energy".to_owned(), energy);
        DerivedState {
            entity_id: EntityId::new(),
            version_number,
            payload,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn upsert_outcome_is_monotonic() {
        let current = derived(2, 0.5);
        assert_eq!(UpsertOutcome::decide(None, &current), UpsertOutcome::Inserted);
        assert_eq!(
            UpsertOutcome::decide(Some(&current), &derived(1, 0.9)),
            UpsertOutcome::Stale
        );
        assert_eq!(
            UpsertOutcome::decide(Some(&current), &derived(3, 0.9)),
            UpsertOutcome::Replaced
        );
        assert_eq!(
            UpsertOutcome::decide(Some(&current), &derived(2, 0.9)),
            UpsertOutcome::Replaced
        );
        assert_eq!(
            UpsertOutcome::decide(Some(&current), &derived(2, 0.5)),
            UpsertOutcome::Unchanged
        );
    }

    #[test]
    fn filter_respects_bounds() {
        let mut state = derived(1, 0.1);
        let filter = DerivedFilter {
            partition: Partition::ALL,
            bounds: Some(CoordinateRange {
                min: Coordinates::new(-1.0, -1.0, -1.0),
                max: Coordinates::new(1.0, 1.0, 1.0),
            }),
        };
        assert!(!filter.matches(&state));
        state.payload.position = Some(Coordinates::new(0.5, 0.0, -0.5));
        assert!(filter.matches(&state));
        state.payload.position = Some(Coordinates::new(2.0, 0.0, 0.0));
        assert!(!filter.matches(&state));
        assert!(DerivedFilter::ALL.matches(&state));
    }

    #[test]
    fn tallies_skip_retired_bonds_and_unrequested_ids() {
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let partner = RelationshipKind::new("partner");
        let bond = |x: EntityId, y: EntityId| EntityContent::Bond {
            endpoints: [x, y],
            kind: partner.clone(),
            fields: Fields::new(),
        };
        let retired = bond(a, c).with_field("status", serde_json::json!("retired"));
        let contents = [bond(a, b), retired, bond(b, c)];
        let tallies = count_tallies(contents.iter(), &[a, b]);
        assert_eq!(tallies.get(&(a, partner.clone())), Some(&1));
        assert_eq!(tallies.get(&(b, partner.clone())), Some(&2));
        assert_eq!(tallies.get(&(c, partner)), None);
    }
}
