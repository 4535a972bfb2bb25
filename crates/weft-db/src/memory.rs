//! In-process implementation of [`DurableStore`].
//!
//! Holds the four relations in ordered maps behind one [`RwLock`], so every
//! operation is trivially atomic and snapshots are consistent. Used for
//! single-process runs and tests.
//!
//! Fault injection hooks let tests make the next operations fail with a
//! transient error, or interrupt the next commit after it was staged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use weft_types::{
    DerivedState, EntityId, EntityView, RegistryRecord, SemanticVersion, WorkflowId,
    WorkflowRecord, WorkflowStatus,
};

use crate::error::DbError;
use crate::store::{
    CommitBatch, CommitGuard, DerivedFilter, DurableStore, StoreSnapshot, TallyMap, UpsertOutcome,
    count_tallies,
};

#[derive(Debug, Default)]
struct Tables {
    registry: BTreeMap<EntityId, RegistryRecord>,
    log: BTreeMap<EntityId, BTreeMap<u64, SemanticVersion>>,
    derived: BTreeMap<EntityId, DerivedState>,
    workflows: BTreeMap<WorkflowId, WorkflowRecord>,
}

impl Tables {
    fn current(&self, entity_id: EntityId) -> Option<&SemanticVersion> {
        self.log
            .get(&entity_id)
            .and_then(|versions| versions.last_key_value())
            .map(|(_, v)| v)
    }

    fn view(&self, entity_id: EntityId) -> Option<EntityView> {
        let registry = self.registry.get(&entity_id)?;
        Some(EntityView {
            registry: registry.clone(),
            current: self.current(entity_id).cloned(),
            derived: self.derived.get(&entity_id).cloned(),
        })
    }

    fn tallies(&self, ids: &[EntityId]) -> TallyMap {
        let bonds = self
            .log
            .values()
            .filter_map(|versions| versions.last_key_value())
            .map(|(_, v)| &v.content)
            .filter(|content| content.bond().is_some());
        count_tallies(bonds, ids)
    }

    fn check_guard(&self, guard: &CommitGuard) -> Result<(), DbError> {
        match guard {
            CommitGuard::Version {
                entity_id,
                expected,
            } => {
                let found = self.current(*entity_id).map_or(0, |v| v.version_number);
                if found != *expected {
                    return Err(DbError::GuardFailed {
                        entity_id: *entity_id,
                        detail: format!("version moved from {expected} to {found}"),
                    });
                }
            }
            CommitGuard::Tally {
                entity_id,
                kind,
                expected,
            } => {
                let found = self
                    .tallies(&[*entity_id])
                    .get(&(*entity_id, kind.clone()))
                    .copied()
                    .unwrap_or(0);
                if found != *expected {
                    return Err(DbError::GuardFailed {
                        entity_id: *entity_id,
                        detail: format!("'{kind}' tally moved from {expected} to {found}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_version_slot(
        &self,
        version: &SemanticVersion,
        registering: bool,
    ) -> Result<(), DbError> {
        if !registering && !self.registry.contains_key(&version.entity_id) {
            return Err(DbError::NotFound(version.entity_id));
        }
        let taken = self
            .log
            .get(&version.entity_id)
            .is_some_and(|versions| versions.contains_key(&version.version_number));
        if taken {
            return Err(DbError::DuplicateVersion {
                entity_id: version.entity_id,
                version_number: version.version_number,
            });
        }
        Ok(())
    }

    fn check_workflow_open(&self, id: WorkflowId) -> Result<(), DbError> {
        match self.workflows.get(&id) {
            None => Err(DbError::WorkflowNotFound(id)),
            Some(stored) if stored.status != WorkflowStatus::Resolving => {
                Err(DbError::WorkflowClosed {
                    id,
                    status: stored.status,
                })
            }
            Some(_) => Ok(()),
        }
    }

    fn insert_version(&mut self, version: &SemanticVersion) {
        self.log
            .entry(version.entity_id)
            .or_default()
            .insert(version.version_number, version.clone());
    }

    fn upsert_derived(&mut self, state: &DerivedState) -> Result<UpsertOutcome, DbError> {
        if !self.registry.contains_key(&state.entity_id) {
            return Err(DbError::NotFound(state.entity_id));
        }
        let outcome = UpsertOutcome::decide(self.derived.get(&state.entity_id), state);
        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Replaced) {
            self.derived.insert(state.entity_id, state.clone());
        }
        Ok(outcome)
    }
}

/// [`DurableStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_next: AtomicU32,
    interrupt_next_commit: AtomicBool,
    snapshot_reads: AtomicU64,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with [`DbError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the next [`DurableStore::commit_atomic`] pass its checks and then
    /// fail before anything becomes visible.
    pub fn interrupt_next_commit(&self) {
        self.interrupt_next_commit.store(true, Ordering::SeqCst);
    }

    /// How many [`DurableStore::read_snapshot`] calls were served.
    pub fn snapshot_reads(&self) -> u64 {
        self.snapshot_reads.load(Ordering::SeqCst)
    }

    /// Number of semantic versions across all entities.
    pub async fn version_count(&self) -> usize {
        self.tables.read().await.log.values().map(BTreeMap::len).sum()
    }

    fn injected_fault(&self) -> Result<(), DbError> {
        let tripped = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(DbError::Unavailable("injected fault".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn register_entity(&self, record: &RegistryRecord) -> Result<(), DbError> {
        self.injected_fault()?;
        let mut tables = self.tables.write().await;
        if tables.registry.contains_key(&record.entity_id) {
            return Err(DbError::DuplicateEntity(record.entity_id));
        }
        tables.registry.insert(record.entity_id, record.clone());
        Ok(())
    }

    async fn append_version(&self, version: &SemanticVersion) -> Result<(), DbError> {
        self.injected_fault()?;
        let mut tables = self.tables.write().await;
        tables.check_version_slot(version, false)?;
        tables.insert_version(version);
        Ok(())
    }

    async fn upsert_derived_state(&self, state: &DerivedState) -> Result<UpsertOutcome, DbError> {
        self.injected_fault()?;
        self.tables.write().await.upsert_derived(state)
    }

    async fn point_read(&self, entity_id: EntityId) -> Result<Option<EntityView>, DbError> {
        self.injected_fault()?;
        Ok(self.tables.read().await.view(entity_id))
    }

    async fn bulk_read_derived(
        &self,
        filter: &DerivedFilter,
    ) -> Result<Vec<DerivedState>, DbError> {
        self.injected_fault()?;
        let tables = self.tables.read().await;
        Ok(tables
            .derived
            .values()
            .filter(|state| filter.matches(state))
            .cloned()
            .collect())
    }

    async fn read_snapshot(&self, ids: &[EntityId]) -> Result<StoreSnapshot, DbError> {
        self.injected_fault()?;
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read().await;
        Ok(StoreSnapshot {
            entities: ids
                .iter()
                .filter_map(|id| tables.view(*id).map(|view| (*id, view)))
                .collect(),
            tallies: tables.tallies(ids),
        })
    }

    async fn relationship_tallies(&self, ids: &[EntityId]) -> Result<TallyMap, DbError> {
        self.injected_fault()?;
        Ok(self.tables.read().await.tallies(ids))
    }

    async fn commit_atomic(&self, batch: &CommitBatch) -> Result<(), DbError> {
        self.injected_fault()?;
        let mut tables = self.tables.write().await;

        for guard in &batch.guards {
            tables.check_guard(guard)?;
        }
        if let Some(record) = &batch.registry {
            if tables.registry.contains_key(&record.entity_id) {
                return Err(DbError::DuplicateEntity(record.entity_id));
            }
        }
        tables.check_version_slot(&batch.version, batch.registry.is_some())?;
        if let Some(workflow) = &batch.workflow {
            tables.check_workflow_open(workflow.id)?;
        }

        if self.interrupt_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DbError::Unavailable(
                "commit interrupted before becoming visible".to_owned(),
            ));
        }

        if let Some(record) = &batch.registry {
            tables.registry.insert(record.entity_id, record.clone());
        }
        tables.insert_version(&batch.version);
        if let Some(derived) = &batch.derived {
            tables.upsert_derived(derived)?;
        }
        if let Some(workflow) = &batch.workflow {
            tables.workflows.insert(workflow.id, workflow.clone());
        }
        Ok(())
    }

    async fn version_history(&self, entity_id: EntityId) -> Result<Vec<SemanticVersion>, DbError> {
        self.injected_fault()?;
        let tables = self.tables.read().await;
        Ok(tables
            .log
            .get(&entity_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        self.injected_fault()?;
        self.tables
            .write()
            .await
            .workflows
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn advance_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        self.injected_fault()?;
        let mut tables = self.tables.write().await;
        tables.check_workflow_open(record.id)?;
        tables.workflows.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, DbError> {
        self.injected_fault()?;
        Ok(self.tables.read().await.workflows.get(&id).cloned())
    }

    async fn resolving_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, DbError> {
        self.injected_fault()?;
        let tables = self.tables.read().await;
        let mut stale: Vec<WorkflowRecord> = tables
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Resolving && w.created_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|w| w.created_at);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use weft_types::{
        DerivedPayload, EntityContent, EntityType, Fields, RelationshipKind, WorkflowResult,
        WriteIntent,
    };

    use super::*;

    fn thread(name: &str) -> EntityContent {
        EntityContent::Thread {
            name: name.to_owned(),
            fields: Fields::new(),
        }
    }

    fn version(entity_id: EntityId, version_number: u64, content: EntityContent) -> SemanticVersion {
        let now = Utc::now();
        SemanticVersion {
            entity_id,
            version_number,
            effective_at: now,
            created_at: now,
            content,
            change_reason: "test".to_owned(),
        }
    }

    fn registry(entity_id: EntityId, entity_type: EntityType) -> RegistryRecord {
        RegistryRecord {
            entity_id,
            entity_type,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_version_is_reported_not_overwritten() {
        let store = MemoryStore::new();
        let id = EntityId::new();
        store.register_entity(&registry(id, EntityType::Thread)).await.unwrap();
        store.append_version(&version(id, 1, thread("John"))).await.unwrap();
        let again = store.append_version(&version(id, 1, thread("Jon"))).await;
        assert!(matches!(again, Err(DbError::DuplicateVersion { version_number: 1, .. })));
        let view = store.point_read(id).await.unwrap().unwrap();
        assert_eq!(view.current.unwrap().content.headline(), "John");
    }

    #[tokio::test]
    async fn append_requires_registration() {
        let store = MemoryStore::new();
        let id = EntityId::new();
        let result = store.append_version(&version(id, 1, thread("ghost"))).await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn interrupted_commit_leaves_nothing_visible() {
        let store = MemoryStore::new();
        let id = EntityId::new();
        let batch = CommitBatch {
            registry: Some(registry(id, EntityType::Thread)),
            version: version(id, 1, thread("Mary")),
            derived: Some(DerivedState {
                entity_id: id,
                version_number: 1,
                payload: DerivedPayload::default(),
                last_updated: Utc::now(),
            }),
            guards: Vec::new(),
            workflow: None,
        };
        store.interrupt_next_commit();
        assert!(store.commit_atomic(&batch).await.is_err());
        assert!(store.point_read(id).await.unwrap().is_none());
        assert_eq!(store.version_count().await, 0);

        store.commit_atomic(&batch).await.unwrap();
        let view = store.point_read(id).await.unwrap().unwrap();
        assert_eq!(view.version_number(), 1);
        assert!(view.derived.is_some());
    }

    #[tokio::test]
    async fn tally_guard_detects_concurrent_bond() {
        let store = MemoryStore::new();
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        for id in [a, b, c] {
            store.register_entity(&registry(id, EntityType::Thread)).await.unwrap();
            store.append_version(&version(id, 1, thread("t"))).await.unwrap();
        }
        let partner = RelationshipKind::new("partner");
        let bond = |x, y| EntityContent::Bond {
            endpoints: [x, y],
            kind: partner.clone(),
            fields: Fields::new(),
        };
        let guard = CommitGuard::Tally {
            entity_id: a,
            kind: partner.clone(),
            expected: 0,
        };

        let first = EntityId::new();
        store
            .commit_atomic(&CommitBatch {
                registry: Some(registry(first, EntityType::Bond)),
                version: version(first, 1, bond(a, b)),
                derived: None,
                guards: vec![guard.clone()],
                workflow: None,
            })
            .await
            .unwrap();

        let second = EntityId::new();
        let result = store
            .commit_atomic(&CommitBatch {
                registry: Some(registry(second, EntityType::Bond)),
                version: version(second, 1, bond(a, c)),
                derived: None,
                guards: vec![guard],
                workflow: None,
            })
            .await;
        assert!(matches!(result, Err(DbError::GuardFailed { .. })));
        assert!(store.point_read(second).await.unwrap().is_none());

        let snapshot = store.read_snapshot(&[a, b, c]).await.unwrap();
        assert_eq!(snapshot.tally(a, &partner), 1);
        assert_eq!(snapshot.tally(c, &partner), 0);
    }

    #[tokio::test]
    async fn commit_closing_a_cancelled_workflow_writes_nothing() {
        let store = MemoryStore::new();
        let id = EntityId::new();
        let mut open = WorkflowRecord::open(
            "entity_write",
            WriteIntent::create(thread("Mary")),
            Vec::new(),
            Vec::new(),
        );
        store.save_workflow(&open).await.unwrap();

        let mut cancelled = open.clone();
        cancelled.finish(
            WorkflowStatus::Cancelled,
            WorkflowResult::Cancelled {
                reason: "abandoned".to_owned(),
            },
        );
        store.advance_workflow(&cancelled).await.unwrap();

        open.finish(WorkflowStatus::Completed, WorkflowResult::Committed { entity_id: id });
        let batch = CommitBatch {
            registry: Some(registry(id, EntityType::Thread)),
            version: version(id, 1, thread("Mary")),
            derived: None,
            guards: Vec::new(),
            workflow: Some(open.clone()),
        };
        let result = store.commit_atomic(&batch).await;
        assert!(matches!(
            result,
            Err(DbError::WorkflowClosed {
                status: WorkflowStatus::Cancelled,
                ..
            })
        ));
        assert!(store.point_read(id).await.unwrap().is_none());

        let late = store.advance_workflow(&open).await;
        assert!(matches!(late, Err(DbError::WorkflowClosed { .. })));
        let stored = store.load_workflow(open.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_counted() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let id = EntityId::new();
        for _ in 0..2 {
            let err = store.point_read(id).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(store.point_read(id).await.unwrap().is_none());
    }
}
