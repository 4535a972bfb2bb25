//! End-to-end write protocol scenarios on the in-process store and bus.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::future::{Future, ready};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Notify, watch};
use weft_cache::{CacheConfig, LiveSync, SpatialCache, SpatialQuery as _};
use weft_core::config::{RelationshipRule, WorkflowConfig};
use weft_core::workflow::ENTITY_WRITE;
use weft_core::{
    CheckBatcher, CommitService, CoreError, DerivationStrategy as _, HashPlacement, Janitor,
    PhysicsProcessor, ProcessOutcome, WeftConfig,
};
use weft_db::{
    CommitBatch, DbError, DerivedFilter, DurableStore, MemoryStore, StoreSnapshot, TallyMap,
    UpsertOutcome,
};
use weft_events::{EventBus, InMemoryBus};
use weft_types::events::TOPIC_RELATIONSHIP_CREATED;
use weft_types::{
    Answers, Comparator, Coordinates, CreateEntity, DerivedCompleted, DerivedPayload,
    DerivedState, DomainEvent, Enforcement, EntityContent, EntityId, EntityProcess, EntityType,
    EntityView, FailureReason, Fields, InputShape, IntentMetadata, ParticleKind, Precondition,
    ProposeRelationship, ProposeStatus, RegistryRecord, RelationshipKind, RetryPolicy,
    SemanticVersion, SupplyInput, SupplyStatus, UpdateEntity, WorkflowId, WorkflowRecord,
    WorkflowStatus, WriteIntent, WriteStatus,
};

// =============================================================================
// Fixtures
// =============================================================================

fn moment(text: &str) -> EntityContent {
    EntityContent::Particle {
        kind: ParticleKind::Moment,
        text: text.to_owned(),
        fields: Fields::new(),
    }
}

fn thread(name: &str) -> EntityContent {
    EntityContent::Thread {
        name: name.to_owned(),
        fields: Fields::new(),
    }
}

fn create(content: EntityContent) -> CreateEntity {
    CreateEntity {
        content,
        preconditions: Vec::new(),
        effective_at: None,
        metadata: IntentMetadata::default(),
    }
}

fn partner(a: EntityId, b: EntityId) -> ProposeRelationship {
    ProposeRelationship {
        endpoints: [a, b],
        kind: RelationshipKind::new("partner"),
        fields: Fields::new(),
    }
}

fn with_partner_rule(enforcement: Enforcement) -> WeftConfig {
    let mut config = WeftConfig::default();
    config.relationships.insert(
        "partner".to_owned(),
        RelationshipRule {
            limit: 1,
            enforcement,
        },
    );
    config
}

fn answers(pairs: &[(&str, serde_json::Value)]) -> Answers {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

fn service_on(
    store: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    config: &WeftConfig,
) -> CommitService {
    let (checker, _task) = CheckBatcher::spawn(Arc::clone(&store), 64, 256);
    CommitService::new(store, bus, checker, Arc::new(HashPlacement), config)
}

async fn create_thread(service: &CommitService, name: &str) -> EntityId {
    service
        .create_entity(create(thread(name)))
        .await
        .unwrap()
        .id
        .unwrap()
}

/// Poll `check` until it holds, failing the test after a few seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Store, bus, commit service, and a cache fed by live-sync, with the
/// physics processor consuming process events.
struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryBus>,
    service: CommitService,
    cache: Arc<SpatialCache>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start(config: WeftConfig, with_physics: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let dyn_bus: Arc<dyn EventBus> = bus.clone();

        let service = service_on(Arc::clone(&dyn_store), Arc::clone(&dyn_bus), &config);
        let cache =
            Arc::new(SpatialCache::new(CacheConfig::default(), Arc::clone(&dyn_store)).unwrap());
        let sync = LiveSync::subscribe(Arc::clone(&cache), bus.as_ref())
            .await
            .unwrap();
        cache.initialize().await.unwrap();

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(sync.run(rx.clone()));

        if with_physics {
            let processor = PhysicsProcessor::new(
                dyn_store,
                dyn_bus,
                Arc::new(HashPlacement),
                RetryPolicy::NONE,
                RetryPolicy::NONE,
            );
            let stream = processor.subscribe().await.unwrap();
            tokio::spawn(processor.run(stream, rx));
        }

        Self {
            store,
            bus,
            service,
            cache,
            shutdown,
        }
    }

    async fn running(config: WeftConfig) -> Self {
        Self::start(config, true).await
    }

    async fn derived_version(&self, id: EntityId) -> Option<u64> {
        self.store
            .point_read(id)
            .await
            .unwrap()
            .and_then(|v| v.derived)
            .map(|d| d.version_number)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Every indexed `(entity, position)` in `cache`, ordered by id.
fn contents(cache: &SpatialCache) -> Vec<(EntityId, Coordinates)> {
    let mut nodes: Vec<(EntityId, Coordinates)> = cache
        .within_radius(&Coordinates::ORIGIN, 10.0)
        .into_iter()
        .map(|n| (n.entity_id, n.position))
        .collect();
    nodes.sort_by_key(|(id, _)| *id);
    nodes
}

// =============================================================================
// Scenario A: fast path, derived state arrives later
// =============================================================================

#[tokio::test]
async fn fast_path_ack_precedes_derived_state() {
    let h = Harness::running(WeftConfig::default()).await;
    let content = moment("walked to the river");

    let response = h.service.create_entity(create(content.clone())).await.unwrap();
    assert_eq!(response.status, WriteStatus::Accepted);
    let e1 = response.id.unwrap();

    // Acknowledged before any derived state exists.
    assert!(
        h.cache
            .nearest(&Coordinates::ORIGIN, 10)
            .iter()
            .all(|n| n.entity_id != e1)
    );

    let expected = HashPlacement.derive(e1, &content, None).position.unwrap();
    eventually("E1 to be indexed", || ready(h.cache.get(e1).is_some())).await;

    let nearest = h.cache.nearest(&expected, 1);
    assert_eq!(nearest[0].entity_id, e1);
    assert!(nearest[0].distance < 1e-9);
    assert_eq!(h.derived_version(e1).await, Some(1));
}

// =============================================================================
// Scenario B: soft cardinality needs an override
// =============================================================================

#[tokio::test]
async fn soft_cardinality_resolves_with_override() {
    let h = Harness::running(with_partner_rule(Enforcement::Soft)).await;
    let mut created_events = h.bus.subscribe(&[TOPIC_RELATIONSHIP_CREATED]).await.unwrap();

    let a = create_thread(&h.service, "A").await;
    let b = create_thread(&h.service, "B").await;
    let c = create_thread(&h.service, "C").await;

    let first = h.service.propose_relationship(partner(a, b)).await.unwrap();
    assert_eq!(first.status, ProposeStatus::Created);

    let versions_before = h.store.version_count().await;
    let second = h.service.propose_relationship(partner(a, c)).await.unwrap();
    assert_eq!(second.status, ProposeStatus::AwaitingInput);
    assert!(second.relationship_id.is_none());
    let names: Vec<&str> = second.failures.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["source_partner_limit"]);
    assert_eq!(second.required_input.len(), 1);
    assert_eq!(second.required_input[0].field, "override.source_partner_limit");
    assert_eq!(second.required_input[0].shape, InputShape::Confirm);
    assert_eq!(h.store.version_count().await, versions_before);

    let workflow_id = second.workflow_id.unwrap();
    let resumed = h
        .service
        .supply_input(SupplyInput {
            workflow_id,
            answers: answers(&[("override.source_partner_limit", json!(true))]),
        })
        .await
        .unwrap();
    assert_eq!(resumed.status, SupplyStatus::Created);
    let bond = resumed.entity_id.unwrap();

    let view = h.store.point_read(bond).await.unwrap().unwrap();
    assert_eq!(view.registry.entity_type, EntityType::Bond);
    assert_eq!(view.current.unwrap().content.bond().map(|(e, _)| *e), Some([a, c]));
    assert!(view.derived.is_some());

    let tallies = h.store.relationship_tallies(&[a]).await.unwrap();
    assert_eq!(tallies.get(&(a, RelationshipKind::new("partner"))), Some(&2));

    let record = h.service.workflow(workflow_id).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);

    let mut announced = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(5), created_events.next())
            .await
            .unwrap()
            .unwrap();
        announced.push(message.decode().unwrap().event.entity_id());
    }
    assert_eq!(announced[1], bond);
}

#[tokio::test]
async fn declining_an_override_fails_the_workflow() {
    let h = Harness::running(with_partner_rule(Enforcement::Soft)).await;
    let a = create_thread(&h.service, "A").await;
    let b = create_thread(&h.service, "B").await;
    let c = create_thread(&h.service, "C").await;
    h.service.propose_relationship(partner(a, b)).await.unwrap();

    let parked = h.service.propose_relationship(partner(a, c)).await.unwrap();
    let workflow_id = parked.workflow_id.unwrap();
    let declined = h
        .service
        .supply_input(SupplyInput {
            workflow_id,
            answers: answers(&[("override.source_partner_limit", json!(false))]),
        })
        .await
        .unwrap();
    assert_eq!(declined.status, SupplyStatus::Failed);
    assert_eq!(
        h.service.workflow(workflow_id).await.unwrap().status,
        WorkflowStatus::Failed
    );
}

// =============================================================================
// Scenario C: duplicate process events
// =============================================================================

#[tokio::test]
async fn duplicate_process_events_write_once() {
    let h = Harness::start(WeftConfig::default(), false).await;
    let id = h
        .service
        .create_entity(create(moment("a pulse")))
        .await
        .unwrap()
        .id
        .unwrap();

    let processor = PhysicsProcessor::new(
        h.store.clone(),
        h.bus.clone(),
        Arc::new(HashPlacement),
        RetryPolicy::NONE,
        RetryPolicy::NONE,
    );
    let event = EntityProcess {
        entity_id: id,
        entity_type: EntityType::Moment,
        version_number: 1,
        effective_at: Utc::now(),
        classification: None,
    };

    let first = processor.process(&event).await.unwrap();
    assert_eq!(first, ProcessOutcome::Derived(UpsertOutcome::Inserted));
    let written = h.store.point_read(id).await.unwrap().unwrap().derived;

    let second = processor.process(&event).await.unwrap();
    assert_eq!(second, ProcessOutcome::Derived(UpsertOutcome::Unchanged));
    assert_eq!(h.store.point_read(id).await.unwrap().unwrap().derived, written);

    eventually("the node to be indexed", || ready(h.cache.get(id).is_some())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.cache.node_count(), 1);
}

#[tokio::test]
async fn overtaken_process_events_leave_newer_state_alone() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let service = service_on(store.clone(), bus.clone(), &WeftConfig::default());
    let id = service
        .create_entity(create(moment("walked to the river")))
        .await
        .unwrap()
        .id
        .unwrap();
    service
        .update_entity(UpdateEntity {
            entity_id: id,
            content: moment("walked to the lake"),
            change_reason: "revised".to_owned(),
            preconditions: Vec::new(),
        })
        .await
        .unwrap();

    let processor = PhysicsProcessor::new(
        store.clone(),
        bus,
        Arc::new(HashPlacement),
        RetryPolicy::NONE,
        RetryPolicy::NONE,
    );
    let event = |version_number: u64, classification: Option<serde_json::Value>| EntityProcess {
        entity_id: id,
        entity_type: EntityType::Moment,
        version_number,
        effective_at: Utc::now(),
        classification,
    };

    let current = processor.process(&event(2, None)).await.unwrap();
    assert_eq!(current, ProcessOutcome::Derived(UpsertOutcome::Inserted));
    let written = store.point_read(id).await.unwrap().unwrap().derived.unwrap();
    assert_eq!(written.version_number, 2);

    // A late copy of the first version's event carries a stale classification.
    let late = processor
        .process(&event(1, Some(json!({"valence": 0.9}))))
        .await
        .unwrap();
    assert_eq!(late, ProcessOutcome::Superseded);
    let after = store.point_read(id).await.unwrap().unwrap().derived.unwrap();
    assert_eq!(after.payload, written.payload);
    assert_eq!(after.last_updated, written.last_updated);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn replayed_events_leave_one_node_at_the_last_position() {
    let h = Harness::running(WeftConfig::default()).await;
    let id = EntityId::new();
    for x in [0.1, 0.2, 0.3, 0.4, 0.5] {
        let event = DomainEvent::DerivedCompleted(DerivedCompleted {
            entity_id: id,
            derived_state: DerivedState {
                entity_id: id,
                version_number: 1,
                payload: DerivedPayload {
                    position: Some(Coordinates::new(x, 0.0, 0.0)),
                    ..DerivedPayload::default()
                },
                last_updated: Utc::now(),
            },
            duration_ms: 0,
        });
        h.bus.publish(&event).await.unwrap();
    }

    eventually("the last replay to land", || {
        ready(
            h.cache
                .get(id)
                .and_then(|d| d.payload.position)
                .is_some_and(|p| (p.0[0] - 0.5).abs() < 1e-12),
        )
    })
    .await;
    assert_eq!(h.cache.node_count(), 1);
}

#[tokio::test]
async fn interrupted_commit_writes_nothing() {
    let mut config = WeftConfig::default();
    config.commit.store_attempts = 1;
    let h = Harness::start(config, false).await;

    // Fast path: the semantic record is visible on its own.
    let a = create_thread(&h.service, "A").await;
    let b = create_thread(&h.service, "B").await;
    let view = h.store.point_read(a).await.unwrap().unwrap();
    assert_eq!(view.version_number(), 1);
    assert!(view.derived.is_none());

    // Transactional path: all or nothing.
    let before = h.store.version_count().await;
    h.store.interrupt_next_commit();
    let err = h
        .service
        .propose_relationship(partner(a, b))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Store(DbError::Unavailable(_))));
    assert_eq!(h.store.version_count().await, before);
    assert!(h.store.relationship_tallies(&[a, b]).await.unwrap().is_empty());

    let retried = h.service.propose_relationship(partner(a, b)).await.unwrap();
    assert_eq!(retried.status, ProposeStatus::Created);
    let bond = h
        .store
        .point_read(retried.relationship_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bond.version_number(), 1);
    assert_eq!(bond.derived.map(|d| d.version_number), Some(1));
}

#[tokio::test]
async fn every_acknowledged_write_is_readable() {
    let h = Harness::running(WeftConfig::default()).await;
    let anchor = create_thread(&h.service, "anchor").await;

    let fast = (0..20).map(|i| h.service.create_entity(create(moment(&format!("m{i}")))));
    let checked = (0..10).map(|i| {
        let mut cmd = create(moment(&format!("c{i}")));
        cmd.preconditions = vec![Precondition::exists("anchor_exists", anchor)];
        h.service.create_entity(cmd)
    });
    let (fast, checked) = tokio::join!(join_all(fast), join_all(checked));

    for response in fast.into_iter().chain(checked) {
        let response = response.unwrap();
        assert_eq!(response.status, WriteStatus::Accepted);
        let view = h.store.point_read(response.id.unwrap()).await.unwrap();
        assert!(view.is_some_and(|v| v.version_number() == 1));
    }
}

#[tokio::test]
async fn false_preconditions_create_nothing() {
    let h = Harness::running(WeftConfig::default()).await;
    let anchor = create_thread(&h.service, "anchor").await;
    let harness = &h;
    eventually("anchor derived state", move || async move {
        harness.derived_version(anchor).await == Some(1)
    })
    .await;
    let before = h.store.version_count().await;

    // Hard failures: rejected, both enumerated in order.
    let mut hard = create(moment("needs energy"));
    hard.preconditions = vec![
        Precondition::threshold("energetic", anchor, "energy", Comparator::Gt, 5.0),
        Precondition::lifecycle("active", anchor, "status", json!("active")),
    ];
    let rejected = h.service.create_entity(hard).await.unwrap();
    assert_eq!(rejected.status, WriteStatus::Rejected);
    assert!(rejected.id.is_none());
    let names: Vec<&str> = rejected.failures.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["energetic", "active"]);
    assert!(matches!(
        rejected.failures[0].reason,
        FailureReason::ThresholdNotMet { .. }
    ));

    // Resolvable failures: parked, enumerated exactly.
    let ghost = EntityId::new();
    let mut soft = create(moment("about a ghost"));
    soft.preconditions = vec![
        Precondition::exists("ghost_exists", ghost),
        Precondition::threshold("calm", anchor, "energy", Comparator::Lt, 0.5)
            .with_enforcement(Enforcement::Soft),
        Precondition::exists("anchor_exists", anchor),
    ];
    let parked = h.service.create_entity(soft).await.unwrap();
    assert_eq!(parked.status, WriteStatus::AwaitingInput);
    let names: Vec<&str> = parked.failures.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["ghost_exists", "calm"]);
    let shapes: Vec<InputShape> = parked.required_input.iter().map(|r| r.shape).collect();
    assert_eq!(shapes, [InputShape::EntityRef, InputShape::Confirm]);

    let record = h.service.workflow(parked.workflow_id.unwrap()).await.unwrap();
    assert_eq!(record.failures, parked.failures);
    assert_eq!(h.store.version_count().await, before);
}

#[tokio::test]
async fn substitution_resumes_a_parked_relationship() {
    let h = Harness::running(WeftConfig::default()).await;
    let a = create_thread(&h.service, "A").await;
    let real = create_thread(&h.service, "B").await;
    let typo = EntityId::new();

    let parked = h.service.propose_relationship(partner(a, typo)).await.unwrap();
    assert_eq!(parked.status, ProposeStatus::AwaitingInput);
    let workflow_id = parked.workflow_id.unwrap();
    assert_eq!(parked.required_input[0].field, "substitute.target_exists");

    // A substitute that does not exist either keeps the workflow open.
    let still_missing = h
        .service
        .supply_input(SupplyInput {
            workflow_id,
            answers: answers(&[("substitute.target_exists", json!(EntityId::new().to_string()))]),
        })
        .await
        .unwrap();
    assert_eq!(still_missing.status, SupplyStatus::Continuing);
    assert_eq!(still_missing.required_input.len(), 1);

    let resolved = h
        .service
        .supply_input(SupplyInput {
            workflow_id,
            answers: answers(&[("substitute.target_exists", json!(real.to_string()))]),
        })
        .await
        .unwrap();
    assert_eq!(resolved.status, SupplyStatus::Created);
    let bond = h
        .store
        .point_read(resolved.entity_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        bond.current.unwrap().content.bond().map(|(e, _)| *e),
        Some([a, real])
    );
}

#[tokio::test]
async fn live_cache_converges_with_fresh_hydration() {
    let h = Harness::running(WeftConfig::default()).await;

    let mut ids = Vec::new();
    for i in 0..8_u32 {
        let mut cmd = create(moment(&format!("moment {i}")));
        cmd.metadata.classification = Some(json!({ "valence": f64::from(i) / 10.0 }));
        ids.push(h.service.create_entity(cmd).await.unwrap().id.unwrap());
    }
    let retired = ids[0];
    let updated = ids[1];
    h.service.retire_entity(retired, "merged").await.unwrap();
    h.service
        .update_entity(UpdateEntity {
            entity_id: updated,
            content: moment("moment 1, revised"),
            change_reason: "typo".to_owned(),
            preconditions: Vec::new(),
        })
        .await
        .unwrap();

    let (harness, live) = (&h, &ids[2..]);
    eventually("every event to land", move || async move {
        live.iter()
            .all(|id| harness.cache.applied_version(*id) == Some(1))
            && harness.cache.applied_version(updated) == Some(2)
            && harness.cache.get(retired).is_none()
            && harness.derived_version(retired).await == Some(2)
    })
    .await;

    let fresh = SpatialCache::new(CacheConfig::default(), h.store.clone()).unwrap();
    fresh.initialize().await.unwrap();

    assert_eq!(h.cache.node_count(), 7);
    assert_eq!(contents(&h.cache), contents(&fresh));
}

// =============================================================================
// Optimistic re-validation
// =============================================================================

/// Interference injected right before a commit.
enum Race {
    Never,
    /// Commit this batch first, once.
    Once(CommitBatch),
    /// Append a new version of this entity before every commit.
    EveryCommit(EntityId),
}

/// A workflow read that parks until the test resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Never,
    /// After listing stale workflows.
    AfterListing,
    /// After loading one workflow.
    AfterLoad,
}

/// A store that lets a competing writer in between check and commit.
struct RacingStore {
    inner: Arc<MemoryStore>,
    race: Mutex<Race>,
    pause: Mutex<Pause>,
    paused: Notify,
    resume: Notify,
}

impl RacingStore {
    /// Park once at `at` if armed for it.
    async fn hold(&self, at: Pause) {
        let armed = {
            let mut pause = self.pause.lock().unwrap();
            if *pause == at {
                *pause = Pause::Never;
                true
            } else {
                false
            }
        };
        if armed {
            self.paused.notify_one();
            self.resume.notified().await;
        }
    }

    async fn interfere(&self) -> Result<(), DbError> {
        let race = {
            let mut race = self.race.lock().unwrap();
            match &*race {
                Race::Never => Race::Never,
                Race::EveryCommit(id) => Race::EveryCommit(*id),
                Race::Once(_) => std::mem::replace(&mut *race, Race::Never),
            }
        };
        match race {
            Race::Never => Ok(()),
            Race::Once(batch) => self.inner.commit_atomic(&batch).await,
            Race::EveryCommit(id) => {
                let view = self.inner.point_read(id).await?.unwrap();
                let current = view.current.unwrap();
                self.inner
                    .append_version(&SemanticVersion {
                        version_number: current.version_number + 1,
                        created_at: Utc::now(),
                        change_reason: "interference".to_owned(),
                        ..current
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl DurableStore for RacingStore {
    async fn register_entity(&self, record: &RegistryRecord) -> Result<(), DbError> {
        self.inner.register_entity(record).await
    }

    async fn append_version(&self, version: &SemanticVersion) -> Result<(), DbError> {
        self.inner.append_version(version).await
    }

    async fn upsert_derived_state(&self, state: &DerivedState) -> Result<UpsertOutcome, DbError> {
        self.inner.upsert_derived_state(state).await
    }

    async fn point_read(&self, entity_id: EntityId) -> Result<Option<EntityView>, DbError> {
        self.inner.point_read(entity_id).await
    }

    async fn bulk_read_derived(
        &self,
        filter: &DerivedFilter,
    ) -> Result<Vec<DerivedState>, DbError> {
        self.inner.bulk_read_derived(filter).await
    }

    async fn read_snapshot(&self, ids: &[EntityId]) -> Result<StoreSnapshot, DbError> {
        self.inner.read_snapshot(ids).await
    }

    async fn relationship_tallies(&self, ids: &[EntityId]) -> Result<TallyMap, DbError> {
        self.inner.relationship_tallies(ids).await
    }

    async fn commit_atomic(&self, batch: &CommitBatch) -> Result<(), DbError> {
        self.interfere().await?;
        self.inner.commit_atomic(batch).await
    }

    async fn version_history(&self, entity_id: EntityId) -> Result<Vec<SemanticVersion>, DbError> {
        self.inner.version_history(entity_id).await
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        self.inner.save_workflow(record).await
    }

    async fn advance_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        self.inner.advance_workflow(record).await
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, DbError> {
        let loaded = self.inner.load_workflow(id).await;
        self.hold(Pause::AfterLoad).await;
        loaded
    }

    async fn resolving_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRecord>, DbError> {
        let listed = self.inner.resolving_workflows_older_than(cutoff).await;
        self.hold(Pause::AfterListing).await;
        listed
    }
}

fn bond_batch(a: EntityId, b: EntityId) -> CommitBatch {
    let id = EntityId::new();
    CommitBatch {
        registry: Some(RegistryRecord {
            entity_id: id,
            entity_type: EntityType::Bond,
            created_at: Utc::now(),
        }),
        version: SemanticVersion {
            entity_id: id,
            version_number: 1,
            effective_at: Utc::now(),
            created_at: Utc::now(),
            content: EntityContent::Bond {
                endpoints: [a, b],
                kind: RelationshipKind::new("partner"),
                fields: Fields::new(),
            },
            change_reason: "created".to_owned(),
        },
        derived: None,
        guards: Vec::new(),
        workflow: None,
    }
}

/// Three threads on a plain store, then a racing store over it.
async fn racing_setup(config: &WeftConfig) -> (Arc<RacingStore>, CommitService, [EntityId; 3]) {
    let inner = Arc::new(MemoryStore::new());
    let plain = service_on(inner.clone(), Arc::new(InMemoryBus::new()), config);
    let a = create_thread(&plain, "A").await;
    let b = create_thread(&plain, "B").await;
    let c = create_thread(&plain, "C").await;

    let racing = Arc::new(RacingStore {
        inner,
        race: Mutex::new(Race::Never),
        pause: Mutex::new(Pause::Never),
        paused: Notify::new(),
        resume: Notify::new(),
    });
    let service = service_on(racing.clone(), Arc::new(InMemoryBus::new()), config);
    (racing, service, [a, b, c])
}

#[tokio::test]
async fn concurrent_relationship_is_caught_at_commit() {
    let config = with_partner_rule(Enforcement::Hard);
    let (racing, service, [a, b, c]) = racing_setup(&config).await;
    *racing.race.lock().unwrap() = Race::Once(bond_batch(a, c));
    let reads_before = racing.inner.snapshot_reads();

    let response = service.propose_relationship(partner(a, b)).await.unwrap();

    assert_eq!(response.status, ProposeStatus::Rejected);
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].name, "source_partner_limit");
    assert_eq!(
        response.failures[0].reason,
        FailureReason::LimitReached {
            kind: RelationshipKind::new("partner"),
            count: 1,
            limit: 1
        }
    );
    // Checked once, raced, checked again.
    assert_eq!(racing.inner.snapshot_reads() - reads_before, 2);
    let tallies = racing.inner.relationship_tallies(&[a, b]).await.unwrap();
    assert_eq!(tallies.get(&(a, RelationshipKind::new("partner"))), Some(&1));
    assert_eq!(tallies.get(&(b, RelationshipKind::new("partner"))), None);
}

#[tokio::test]
async fn persistent_interference_reports_contention() {
    let mut config = WeftConfig::default();
    config.commit.revalidation_attempts = 2;
    let (racing, service, [a, b, _]) = racing_setup(&config).await;
    *racing.race.lock().unwrap() = Race::EveryCommit(a);

    let err = service.propose_relationship(partner(a, b)).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Contention { entity_id, attempts: 3 } if entity_id == a
    ));
    assert!(err.is_transient());
    assert!(racing.inner.relationship_tallies(&[a, b]).await.unwrap().is_empty());
}

// =============================================================================
// Janitor
// =============================================================================

async fn status(store: &MemoryStore, id: WorkflowId) -> WorkflowStatus {
    store.load_workflow(id).await.unwrap().unwrap().status
}

fn reaper(store: Arc<dyn DurableStore>) -> Janitor {
    Janitor::new(
        store,
        &WorkflowConfig {
            abandon_after_secs: 60,
            janitor_interval_secs: 60,
        },
    )
}

/// A partner proposal parked on a soft limit, `a` already partnered to `b`.
async fn parked_override(service: &CommitService, [a, b, c]: [EntityId; 3]) -> WorkflowId {
    let first = service.propose_relationship(partner(a, b)).await.unwrap();
    assert_eq!(first.status, ProposeStatus::Created);
    let second = service.propose_relationship(partner(a, c)).await.unwrap();
    assert_eq!(second.status, ProposeStatus::AwaitingInput);
    second.workflow_id.unwrap()
}

fn confirm_override(workflow_id: WorkflowId) -> SupplyInput {
    SupplyInput {
        workflow_id,
        answers: answers(&[("override.source_partner_limit", json!(true))]),
    }
}

#[tokio::test(start_paused = true)]
async fn janitor_cancels_workflows_once_they_age_out() {
    let store = Arc::new(MemoryStore::new());
    let anchor = (tokio::time::Instant::now(), Utc::now());
    let clock = move || anchor.1 + chrono::Duration::from_std(anchor.0.elapsed()).unwrap();

    let open = || {
        let mut record = WorkflowRecord::open(
            ENTITY_WRITE,
            WriteIntent::create(thread("Mary")),
            Vec::new(),
            Vec::new(),
        );
        record.created_at = clock();
        record
    };
    let first = open();
    store.save_workflow(&first).await.unwrap();

    let janitor = Janitor::new(
        store.clone(),
        &WorkflowConfig {
            abandon_after_secs: 90,
            janitor_interval_secs: 60,
        },
    )
    .with_clock(Arc::new(clock));
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(janitor.run(rx));

    // Swept at 0s and 60s, both younger than 90s.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(status(&store, first.id).await, WorkflowStatus::Resolving);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status(&store, first.id).await, WorkflowStatus::Cancelled);

    let second = open();
    store.save_workflow(&second).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status(&store, second.id).await, WorkflowStatus::Resolving);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status(&store, second.id).await, WorkflowStatus::Cancelled);

    shutdown.send(true).unwrap();
    assert_eq!(task.await.unwrap(), 2);

    // Domain state is untouched.
    assert_eq!(store.version_count().await, 0);
}

#[tokio::test]
async fn janitor_leaves_workflows_completed_after_listing() {
    let config = with_partner_rule(Enforcement::Soft);
    let (racing, service, threads) = racing_setup(&config).await;
    let workflow_id = parked_override(&service, threads).await;

    *racing.pause.lock().unwrap() = Pause::AfterListing;
    let janitor = reaper(racing.clone());
    let sweep = tokio::spawn(async move {
        janitor
            .sweep_at(Utc::now() + chrono::Duration::hours(1))
            .await
    });
    racing.paused.notified().await;

    let resumed = service.supply_input(confirm_override(workflow_id)).await.unwrap();
    assert_eq!(resumed.status, SupplyStatus::Created);
    racing.resume.notify_one();

    assert_eq!(sweep.await.unwrap().unwrap(), 0);
    assert_eq!(status(&racing.inner, workflow_id).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn input_for_a_workflow_reclaimed_mid_check_writes_nothing() {
    let config = with_partner_rule(Enforcement::Soft);
    let (racing, service, threads) = racing_setup(&config).await;
    let workflow_id = parked_override(&service, threads).await;
    let versions_before = racing.inner.version_count().await;

    *racing.pause.lock().unwrap() = Pause::AfterLoad;
    let service = Arc::new(service);
    let supply = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.supply_input(confirm_override(workflow_id)).await })
    };
    racing.paused.notified().await;

    let reclaimed = reaper(racing.inner.clone())
        .sweep_at(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);
    racing.resume.notify_one();

    let err = supply.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        CoreError::WorkflowClosed {
            status: WorkflowStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(racing.inner.version_count().await, versions_before);
    assert_eq!(status(&racing.inner, workflow_id).await, WorkflowStatus::Cancelled);
    let [a, ..] = threads;
    let tallies = racing.inner.relationship_tallies(&[a]).await.unwrap();
    assert_eq!(tallies.get(&(a, RelationshipKind::new("partner"))), Some(&1));
}
