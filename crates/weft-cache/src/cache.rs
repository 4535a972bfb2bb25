//! The per-process spatial cache.
//!
//! [`SpatialCache`] is an explicitly constructed, owned component. Its
//! lifecycle is `initialize` (hydrate from the durable store), `apply`
//! (live-sync events), `rehydrate` (after an invariant violation) and
//! `shutdown`. Only the owning process's event-consumption path mutates it.
//!
//! Version bookkeeping makes every mutation idempotent: an event or
//! hydration row older than what was already applied is ignored, equal
//! versions overwrite in arrival order.
//!
//! Hydration builds the next generation off-lock while the current one keeps
//! serving queries and live-sync keeps applying events. Entities live-sync
//! touched during the read are merged into the new generation before the
//! brief swap, so a hydration row never overwrites a newer live event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use weft_db::{DbError, DerivedFilter, DurableStore};
use weft_types::retry::retry;
use weft_types::{
    Coordinates, DerivedState, DomainEvent, EntityId, EventEnvelope, Partition, RetryPolicy,
};

use crate::error::CacheError;
use crate::index::{Neighbor, SpatialIndex};
use crate::query::SpatialQuery;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Which rows this process owns; also bounds the hydration read.
    pub filter: DerivedFilter,
    /// Grid cell edge length.
    pub cell_size: f64,
    /// Retry budget for the hydration bulk read. Exhausting it is fatal.
    pub hydration_retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            filter: DerivedFilter::ALL,
            cell_size: 0.25,
            hydration_retry: RetryPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Restrict the cache to `partition`.
    #[must_use]
    pub const fn with_partition(mut self, partition: Partition) -> Self {
        self.filter.partition = partition;
        self
    }
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    /// Constructed, not yet hydrated.
    Empty,
    /// Bulk read in progress; live events are already being applied.
    Hydrating,
    /// Hydrated and serving.
    Live,
    /// Shut down; no further events are applied.
    ShutDown,
}

/// What [`SpatialCache::apply`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new node was indexed.
    Inserted,
    /// An existing node was replaced.
    Updated,
    /// The version was recorded but the row has no position (or falls
    /// outside the configured bounds), so nothing is indexed.
    NotIndexed,
    /// A node was removed by a tombstone.
    Removed,
    /// Older than what was already applied; ignored.
    Stale,
    /// Not for this cache (other partition, or a topic the cache ignores).
    Skipped,
}

/// Result of one hydration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationReport {
    /// Generation after this pass.
    pub generation: u64,
    /// Rows returned by the bulk read.
    pub rows_read: usize,
    /// Rows that were newer than live-synced state and got applied.
    pub rows_applied: usize,
    /// Indexed nodes after this pass.
    pub nodes: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lifecycle phase.
    pub phase: CachePhase,
    /// Hydration generation.
    pub generation: u64,
    /// Indexed nodes.
    pub nodes: usize,
    /// `published_at` of the newest applied event.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CacheState {
    phase: CachePhase,
    generation: u64,
    index: SpatialIndex,
    /// Highest applied derived version per entity.
    versions: HashMap<EntityId, u64>,
    /// Semantic version at which each entity was tombstoned.
    tombstones: HashMap<EntityId, u64>,
    watermark: Option<DateTime<Utc>>,
    /// Entities live-sync touched while a hydration read is in flight.
    pending: Option<HashSet<EntityId>>,
}

/// A generation built from one bulk read.
struct Generation {
    index: SpatialIndex,
    versions: HashMap<EntityId, u64>,
    rows_read: usize,
}

impl CacheState {
    fn is_stale(&self, entity_id: EntityId, version: u64) -> bool {
        let tombstoned = self.tombstones.get(&entity_id).is_some_and(|t| version <= *t);
        let older = self.versions.get(&entity_id).is_some_and(|v| version < *v);
        tombstoned || older
    }

    fn advance_watermark(&mut self, published_at: DateTime<Utc>) {
        if self.watermark.is_none_or(|w| published_at > w) {
            self.watermark = Some(published_at);
        }
    }

    fn touch(&mut self, entity_id: EntityId) {
        if let Some(pending) = &mut self.pending {
            pending.insert(entity_id);
        }
    }

    /// Carry live-synced state for `touched` entities into `next`.
    ///
    /// A hydration row wins only if it is newer than both the live version
    /// and any tombstone. Returns how many hydration rows lost.
    fn merge_into(
        &self,
        next: &mut Generation,
        tombstones: &mut HashMap<EntityId, u64>,
        touched: HashSet<EntityId>,
    ) -> Result<usize, CacheError> {
        let mut overridden: usize = 0;
        for entity_id in touched {
            let hydrated = next.versions.get(&entity_id).copied();
            let live = self.versions.get(&entity_id).copied();
            let tombstone = self.tombstones.get(&entity_id).copied();
            if let Some(t) = tombstone {
                tombstones.insert(entity_id, t);
            }
            let hydrated_wins = hydrated.is_some_and(|h| {
                tombstone.is_none_or(|t| h > t) && live.is_none_or(|l| h > l)
            });
            if hydrated_wins {
                continue;
            }
            if hydrated.is_some() {
                overridden = overridden.saturating_add(1);
            }
            match self.index.get(entity_id) {
                Some(node) => {
                    next.index.upsert(node.clone());
                }
                None => {
                    next.index.remove(entity_id);
                }
            }
            match live {
                Some(version) => next.versions.insert(entity_id, version),
                None => next.versions.remove(&entity_id),
            };
            next.index.verify_entity(entity_id)?;
        }
        Ok(overridden)
    }
}

/// Spatial index plus its synchronization bookkeeping.
pub struct SpatialCache {
    config: CacheConfig,
    store: Arc<dyn DurableStore>,
    state: RwLock<CacheState>,
}

impl SpatialCache {
    /// Construct an empty cache. Call [`initialize`](Self::initialize) to hydrate.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] for an invalid cell size.
    pub fn new(config: CacheConfig, store: Arc<dyn DurableStore>) -> Result<Self, CacheError> {
        let index = SpatialIndex::new(config.cell_size)?;
        Ok(Self {
            config,
            store,
            state: RwLock::new(CacheState {
                phase: CachePhase::Empty,
                generation: 0,
                index,
                versions: HashMap::new(),
                tombstones: HashMap::new(),
                watermark: None,
                pending: None,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration this cache was built with.
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Hydrate from the durable store.
    ///
    /// May run while live-sync is already applying events; rows older than
    /// what live-sync applied are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::HydrationFailed`] once the retry budget is
    /// exhausted (fatal for the process), or [`CacheError::ShutDown`].
    pub async fn initialize(&self) -> Result<HydrationReport, CacheError> {
        self.hydrate(true).await
    }

    /// Replace the cache contents with a fresh read of the store.
    ///
    /// Queries keep seeing the current generation until the new one is
    /// swapped in. Only events applied during the read survive from the old
    /// generation.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize).
    pub async fn rehydrate(&self) -> Result<HydrationReport, CacheError> {
        self.hydrate(false).await
    }

    async fn hydrate(&self, keep_live: bool) -> Result<HydrationReport, CacheError> {
        {
            let mut state = self.write();
            if state.phase == CachePhase::ShutDown {
                return Err(CacheError::ShutDown);
            }
            let touched: HashSet<EntityId> = if keep_live {
                state
                    .versions
                    .keys()
                    .chain(state.tombstones.keys())
                    .copied()
                    .collect()
            } else {
                tracing::warn!(
                    generation = state.generation,
                    nodes = state.index.len(),
                    "Rebuilding spatial cache from the store"
                );
                HashSet::new()
            };
            state.pending = Some(touched);
            state.phase = CachePhase::Hydrating;
        }
        tracing::info!(
            partition = self.config.filter.partition.index,
            partitions = self.config.filter.partition.count,
            "Hydrating spatial cache"
        );

        let mut next = match self.read_generation().await {
            Ok(next) => next,
            Err(e) => {
                let mut state = self.write();
                state.pending = None;
                if state.phase == CachePhase::Hydrating {
                    state.phase = if state.generation > 0 {
                        CachePhase::Live
                    } else {
                        CachePhase::Empty
                    };
                }
                return Err(e);
            }
        };

        let mut state = self.write();
        if state.phase == CachePhase::ShutDown {
            return Err(CacheError::ShutDown);
        }
        let touched = state.pending.take().unwrap_or_default();
        let mut tombstones = HashMap::new();
        let overridden = match state.merge_into(&mut next, &mut tombstones, touched) {
            Ok(overridden) => overridden,
            Err(e) => {
                state.phase = if state.generation > 0 {
                    CachePhase::Live
                } else {
                    CachePhase::Empty
                };
                return Err(e);
            }
        };
        let old_index = std::mem::replace(&mut state.index, next.index);
        let old_versions = std::mem::replace(&mut state.versions, next.versions);
        let old_tombstones = std::mem::replace(&mut state.tombstones, tombstones);
        state.generation = state.generation.saturating_add(1);
        state.phase = CachePhase::Live;

        let report = HydrationReport {
            generation: state.generation,
            rows_read: next.rows_read,
            rows_applied: next.rows_read.saturating_sub(overridden),
            nodes: state.index.len(),
        };
        drop(state);
        drop((old_index, old_versions, old_tombstones));
        tracing::info!(
            generation = report.generation,
            rows_read = report.rows_read,
            rows_applied = report.rows_applied,
            nodes = report.nodes,
            "Spatial cache hydrated"
        );
        Ok(report)
    }

    /// Bulk-read the store and index the rows, without touching the cache.
    async fn read_generation(&self) -> Result<Generation, CacheError> {
        let store = self.store.as_ref();
        let filter = &self.config.filter;
        let rows = retry(
            &self.config.hydration_retry,
            "cache_hydrate",
            DbError::is_transient,
            move || async move { store.bulk_read_derived(filter).await },
        )
        .await
        .map_err(CacheError::HydrationFailed)?;

        let rows_read = rows.len();
        let mut index = SpatialIndex::new(self.config.cell_size)?;
        let mut versions = HashMap::with_capacity(rows_read);
        for row in rows {
            versions.insert(row.entity_id, row.version_number);
            index.upsert(row);
        }
        index.verify()?;
        Ok(Generation {
            index,
            versions,
            rows_read,
        })
    }

    /// Apply one live-sync event.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Malformed`] for self-inconsistent events,
    /// [`CacheError::Invariant`] if the index disagrees with itself after the
    /// mutation, and [`CacheError::ShutDown`] after shutdown.
    pub fn apply(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, CacheError> {
        match &envelope.event {
            DomainEvent::DerivedCompleted(event) => {
                if event.derived_state.entity_id != event.entity_id {
                    return Err(CacheError::Malformed(format!(
                        "derived_completed for {} carries state of {}",
                        event.entity_id, event.derived_state.entity_id
                    )));
                }
                self.apply_derived(&event.derived_state, envelope.published_at)
            }
            DomainEvent::EntityTombstoned(event) => {
                self.apply_tombstone(event.entity_id, event.version_number, envelope.published_at)
            }
            DomainEvent::EntityProcess(_) | DomainEvent::RelationshipCreated(_) => {
                Ok(ApplyOutcome::Skipped)
            }
        }
    }

    fn apply_derived(
        &self,
        derived: &DerivedState,
        published_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, CacheError> {
        let entity_id = derived.entity_id;
        if !self.config.filter.partition.contains(&entity_id) {
            return Ok(ApplyOutcome::Skipped);
        }
        let mut state = self.write();
        if state.phase == CachePhase::ShutDown {
            return Err(CacheError::ShutDown);
        }
        if state.is_stale(entity_id, derived.version_number) {
            return Ok(ApplyOutcome::Stale);
        }

        let existed = state.index.contains(entity_id);
        let indexed = if self.config.filter.matches(derived) {
            state.index.upsert(derived.clone())
        } else {
            state.index.remove(entity_id);
            false
        };
        state.versions.insert(entity_id, derived.version_number);
        state.touch(entity_id);
        state.advance_watermark(published_at);
        state.index.verify_entity(entity_id)?;

        Ok(match (indexed, existed) {
            (false, _) => ApplyOutcome::NotIndexed,
            (true, true) => ApplyOutcome::Updated,
            (true, false) => ApplyOutcome::Inserted,
        })
    }

    fn apply_tombstone(
        &self,
        entity_id: EntityId,
        version: u64,
        published_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, CacheError> {
        if !self.config.filter.partition.contains(&entity_id) {
            return Ok(ApplyOutcome::Skipped);
        }
        let mut state = self.write();
        if state.phase == CachePhase::ShutDown {
            return Err(CacheError::ShutDown);
        }
        if state.versions.get(&entity_id).is_some_and(|v| *v > version) {
            return Ok(ApplyOutcome::Stale);
        }
        let removed = state.index.remove(entity_id).is_some();
        let previous = state.tombstones.get(&entity_id).copied().unwrap_or(0);
        state.tombstones.insert(entity_id, previous.max(version));
        state.touch(entity_id);
        state.advance_watermark(published_at);
        Ok(if removed {
            ApplyOutcome::Removed
        } else {
            ApplyOutcome::Stale
        })
    }

    /// Highest derived version applied for `entity_id`.
    pub fn applied_version(&self, entity_id: EntityId) -> Option<u64> {
        self.read().versions.get(&entity_id).copied()
    }

    /// Check the whole index.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Invariant`] on disagreement.
    pub fn verify(&self) -> Result<(), CacheError> {
        self.read().index.verify()
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.read();
        CacheStats {
            phase: state.phase,
            generation: state.generation,
            nodes: state.index.len(),
            watermark: state.watermark,
        }
    }

    /// Stop applying events and release the index.
    pub fn shutdown(&self) -> CacheStats {
        let mut state = self.write();
        state.phase = CachePhase::ShutDown;
        let stats = CacheStats {
            phase: state.phase,
            generation: state.generation,
            nodes: state.index.len(),
            watermark: state.watermark,
        };
        state.index.clear();
        state.versions.clear();
        state.tombstones.clear();
        state.pending = None;
        drop(state);
        tracing::info!(
            generation = stats.generation,
            nodes = stats.nodes,
            "Spatial cache shut down"
        );
        stats
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, entity_id: EntityId) {
        self.write().index.corrupt(entity_id);
    }
}

impl SpatialQuery for SpatialCache {
    fn nearest(&self, point: &Coordinates, k: usize) -> Vec<Neighbor> {
        self.read().index.nearest(point, k)
    }

    fn within_radius(&self, point: &Coordinates, radius: f64) -> Vec<Neighbor> {
        self.read().index.within_radius(point, radius)
    }

    fn get(&self, entity_id: EntityId) -> Option<DerivedState> {
        self.read().index.get(entity_id).cloned()
    }

    fn node_count(&self) -> usize {
        self.read().index.len()
    }

    fn generation(&self) -> u64 {
        self.read().generation
    }
}

impl std::fmt::Debug for SpatialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SpatialCache")
            .field("phase", &stats.phase)
            .field("generation", &stats.generation)
            .field("nodes", &stats.nodes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use weft_db::MemoryStore;
    use weft_types::{DerivedCompleted, DerivedPayload, EntityTombstoned};

    use super::*;

    fn derived(entity_id: EntityId, version_number: u64, x: f64) -> DerivedState {
        DerivedState {
            entity_id,
            version_number,
            payload: DerivedPayload {
                position: Some(Coordinates::new(x, 0.0, 0.0)),
                ..DerivedPayload::default()
            },
            last_updated: Utc::now(),
        }
    }

    fn completed(state: DerivedState) -> EventEnvelope {
        EventEnvelope::wrap(DomainEvent::DerivedCompleted(DerivedCompleted {
            entity_id: state.entity_id,
            derived_state: state,
            duration_ms: 1,
        }))
    }

    fn cache() -> SpatialCache {
        SpatialCache::new(CacheConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn redelivery_and_regression_are_ignored() {
        let cache = cache();
        let id = EntityId::new();
        assert_eq!(cache.apply(&completed(derived(id, 2, 0.5))).unwrap(), ApplyOutcome::Inserted);
        assert_eq!(cache.apply(&completed(derived(id, 2, 0.7))).unwrap(), ApplyOutcome::Updated);
        assert_eq!(cache.apply(&completed(derived(id, 1, 0.1))).unwrap(), ApplyOutcome::Stale);
        let position = cache.get(id).unwrap().payload.position.unwrap();
        assert!((position.0[0] - 0.7).abs() < f64::EPSILON);
        assert_eq!(cache.applied_version(id), Some(2));
    }

    #[test]
    fn tombstone_removes_and_blocks_older_versions() {
        let cache = cache();
        let id = EntityId::new();
        cache.apply(&completed(derived(id, 1, 0.5))).unwrap();
        let tombstone = EventEnvelope::wrap(DomainEvent::EntityTombstoned(EntityTombstoned {
            entity_id: id,
            version_number: 2,
        }));
        assert_eq!(cache.apply(&tombstone).unwrap(), ApplyOutcome::Removed);
        assert_eq!(cache.apply(&tombstone).unwrap(), ApplyOutcome::Stale);
        assert_eq!(cache.apply(&completed(derived(id, 2, 0.5))).unwrap(), ApplyOutcome::Stale);
        assert_eq!(cache.node_count(), 0);
        assert_eq!(cache.apply(&completed(derived(id, 3, 0.5))).unwrap(), ApplyOutcome::Inserted);
    }

    #[test]
    fn mismatched_event_is_malformed() {
        let cache = cache();
        let mut envelope = completed(derived(EntityId::new(), 1, 0.0));
        if let DomainEvent::DerivedCompleted(event) = &mut envelope.event {
            event.entity_id = EntityId::new();
        }
        assert!(matches!(cache.apply(&envelope), Err(CacheError::Malformed(_))));
    }

    #[test]
    fn other_partitions_are_skipped() {
        let config = CacheConfig::default().with_partition(Partition { index: 0, count: 2 });
        let cache = SpatialCache::new(config, Arc::new(MemoryStore::new())).unwrap();
        let foreign = std::iter::repeat_with(EntityId::new)
            .find(|id| !Partition { index: 0, count: 2 }.contains(id))
            .unwrap();
        assert_eq!(
            cache.apply(&completed(derived(foreign, 1, 0.0))).unwrap(),
            ApplyOutcome::Skipped
        );
    }

    #[test]
    fn watermark_tracks_latest_published_at() {
        let cache = cache();
        let first = completed(derived(EntityId::new(), 1, 0.0));
        let mut second = completed(derived(EntityId::new(), 1, 0.0));
        second.published_at = first.published_at + chrono::Duration::seconds(5);
        cache.apply(&second).unwrap();
        cache.apply(&first).unwrap();
        assert_eq!(cache.stats().watermark, Some(second.published_at));
    }

    #[tokio::test]
    async fn hydration_honours_tombstones_seen_first() {
        let store = Arc::new(MemoryStore::new());
        let id = EntityId::new();
        store
            .register_entity(&weft_types::RegistryRecord {
                entity_id: id,
                entity_type: weft_types::EntityType::Moment,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.upsert_derived_state(&derived(id, 1, 0.5)).await.unwrap();

        let cache = SpatialCache::new(CacheConfig::default(), store).unwrap();
        let tombstone = EventEnvelope::wrap(DomainEvent::EntityTombstoned(EntityTombstoned {
            entity_id: id,
            version_number: 1,
        }));
        cache.apply(&tombstone).unwrap();

        let report = cache.initialize().await.unwrap();
        assert_eq!(report.rows_read, 1);
        assert_eq!(report.rows_applied, 0);
        assert_eq!(report.nodes, 0);
        assert!(cache.get(id).is_none());
        assert_eq!(cache.apply(&completed(derived(id, 1, 0.5))).unwrap(), ApplyOutcome::Stale);
    }

    #[test]
    fn shutdown_rejects_events() {
        let cache = cache();
        cache.apply(&completed(derived(EntityId::new(), 1, 0.0))).unwrap();
        let stats = cache.shutdown();
        assert_eq!(stats.nodes, 1);
        assert_eq!(cache.node_count(), 0);
        assert!(matches!(
            cache.apply(&completed(derived(EntityId::new(), 1, 0.0))),
            Err(CacheError::ShutDown)
        ));
    }
}
