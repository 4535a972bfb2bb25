//! Precondition evaluation against one consistent store snapshot.
//!
//! [`evaluate`] is pure: given a [`StoreSnapshot`] it reports every failing
//! condition in precondition order, plus the [`CommitGuard`]s that pin the
//! observed state so the commit can detect a race.
//!
//! [`CheckBatcher`] is the async front. Concurrent checks queue on a
//! channel and are served in batches: one snapshot read covers the union of
//! ids referenced by every request in the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use weft_db::{CommitGuard, DurableStore, StoreSnapshot};
use weft_types::{
    ConditionFailure, ConditionType, EntityId, EntityType, EntityView, FailureReason,
    Precondition,
};

use crate::error::CoreError;

/// Result of checking one intent's preconditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckReport {
    /// Failing conditions, in precondition order.
    pub failures: Vec<ConditionFailure>,
    /// Guards to attach to the commit.
    pub guards: Vec<CommitGuard>,
    /// Current version of every requested entity (0 when missing).
    pub versions: BTreeMap<EntityId, u64>,
    /// Registry type of every requested entity that exists.
    pub entity_types: BTreeMap<EntityId, EntityType>,
}

impl CheckReport {
    /// Whether every condition held.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Observed version of `entity_id`, or 0.
    pub fn version_of(&self, entity_id: EntityId) -> u64 {
        self.versions.get(&entity_id).copied().unwrap_or(0)
    }
}

/// A live, non-retired entity in the snapshot.
fn resolvable(snapshot: &StoreSnapshot, entity_id: EntityId) -> Option<&EntityView> {
    snapshot
        .entities
        .get(&entity_id)
        .filter(|view| !view.current.as_ref().is_some_and(|v| v.content.is_retired()))
}

fn evaluate_one(p: &Precondition, snapshot: &StoreSnapshot) -> Option<FailureReason> {
    let Some(view) = resolvable(snapshot, p.target) else {
        return Some(FailureReason::Missing);
    };
    match &p.condition {
        ConditionType::Exists => None,
        ConditionType::LifecycleState { field, expected } => {
            let found = view.semantic_field(field);
            (found != Some(expected)).then(|| FailureReason::StateMismatch {
                expected: expected.clone(),
                found: found.cloned(),
            })
        }
        ConditionType::Threshold {
            field,
            comparator,
            bound,
        } => match view.derived_scalar(field) {
            None => Some(FailureReason::FieldAbsent {
                field: field.clone(),
            }),
            Some(value) if comparator.holds(value, *bound) => None,
            Some(value) => Some(FailureReason::ThresholdNotMet {
                value,
                comparator: *comparator,
                bound: *bound,
            }),
        },
        ConditionType::Cardinality { kind, limit } => {
            let count = snapshot.tally(p.target, kind);
            (count >= *limit).then(|| FailureReason::LimitReached {
                kind: kind.clone(),
                count,
                limit: *limit,
            })
        }
    }
}

/// Evaluate `preconditions` in order against `snapshot`.
///
/// `extra_ids` are entities the write touches without a precondition (the
/// target of an update); they get a version guard and an entry in
/// [`CheckReport::versions`].
pub fn evaluate(
    preconditions: &[Precondition],
    extra_ids: &[EntityId],
    snapshot: &StoreSnapshot,
) -> CheckReport {
    let mut report = CheckReport::default();

    for p in preconditions {
        if let Some(reason) = evaluate_one(p, snapshot) {
            report.failures.push(ConditionFailure {
                name: p.name.clone(),
                target: p.target,
                enforcement: p.enforcement,
                reason,
            });
        }
        if let ConditionType::Cardinality { kind, .. } = &p.condition {
            let guard = CommitGuard::Tally {
                entity_id: p.target,
                kind: kind.clone(),
                expected: snapshot.tally(p.target, kind),
            };
            if !report.guards.contains(&guard) {
                report.guards.push(guard);
            }
        }
    }

    let ids = preconditions.iter().map(|p| p.target).chain(extra_ids.iter().copied());
    for id in ids {
        if report.versions.contains_key(&id) {
            continue;
        }
        let view = snapshot.entities.get(&id);
        let version = view.map_or(0, EntityView::version_number);
        if let Some(view) = view {
            report.entity_types.insert(id, view.registry.entity_type);
        }
        report.versions.insert(id, version);
        report.guards.push(CommitGuard::Version {
            entity_id: id,
            expected: version,
        });
    }

    report
}

/// Read one snapshot and evaluate against it, without batching.
///
/// # Errors
///
/// Returns [`CoreError::Store`] if the snapshot read fails.
pub async fn check_once(
    store: &dyn DurableStore,
    preconditions: &[Precondition],
    extra_ids: &[EntityId],
) -> Result<CheckReport, CoreError> {
    let ids = union_ids(preconditions, extra_ids, Vec::new());
    let snapshot = store.read_snapshot(&ids).await?;
    Ok(evaluate(preconditions, extra_ids, &snapshot))
}

fn union_ids(
    preconditions: &[Precondition],
    extra_ids: &[EntityId],
    mut into: Vec<EntityId>,
) -> Vec<EntityId> {
    for id in preconditions.iter().map(|p| p.target).chain(extra_ids.iter().copied()) {
        if !into.contains(&id) {
            into.push(id);
        }
    }
    into
}

struct CheckRequest {
    preconditions: Vec<Precondition>,
    extra_ids: Vec<EntityId>,
    reply: oneshot::Sender<Result<CheckReport, CoreError>>,
}

/// Handle to the batching checker task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CheckBatcher {
    tx: mpsc::Sender<CheckRequest>,
}

impl std::fmt::Debug for CheckRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRequest")
            .field("preconditions", &self.preconditions.len())
            .field("extra_ids", &self.extra_ids.len())
            .finish_non_exhaustive()
    }
}

impl CheckBatcher {
    /// Spawn the checker task.
    ///
    /// At most `max_batch` queued requests share one snapshot read. The task
    /// exits once every handle is dropped.
    pub fn spawn(
        store: Arc<dyn DurableStore>,
        max_batch: usize,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = tokio::spawn(run_batcher(store, rx, max_batch.max(1)));
        (Self { tx }, handle)
    }

    /// Check `preconditions` (and pin `extra_ids`) against a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Snapshot`] if the batch's snapshot read failed,
    /// or [`CoreError::CheckerStopped`] if the task is gone.
    pub async fn check(
        &self,
        preconditions: Vec<Precondition>,
        extra_ids: Vec<EntityId>,
    ) -> Result<CheckReport, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CheckRequest {
                preconditions,
                extra_ids,
                reply,
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Check batcher is gone");
                CoreError::CheckerStopped
            })?;
        rx.await.map_err(|e| {
            tracing::error!(error = %e, "Check batcher dropped a request");
            CoreError::CheckerStopped
        })?
    }
}

async fn run_batcher(
    store: Arc<dyn DurableStore>,
    mut rx: mpsc::Receiver<CheckRequest>,
    max_batch: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        let ids = batch.iter().fold(Vec::new(), |acc, r| {
            union_ids(&r.preconditions, &r.extra_ids, acc)
        });
        tracing::debug!(requests = batch.len(), ids = ids.len(), "Serving check batch");

        match store.read_snapshot(&ids).await {
            Ok(snapshot) => {
                for request in batch {
                    let report = evaluate(&request.preconditions, &request.extra_ids, &snapshot);
                    // The caller may have given up; nothing to do then.
                    let _ = request.reply.send(Ok(report));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, requests = batch.len(), "Check snapshot read failed");
                let transient = e.is_transient();
                let reason = e.to_string();
                for request in batch {
                    let _ = request.reply.send(Err(CoreError::Snapshot {
                        transient,
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }
    tracing::debug!("Check batcher stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use chrono::Utc;
    use serde_json::json;
    use weft_db::{CommitBatch, MemoryStore};
    use weft_types::{
        Comparator, DerivedPayload, DerivedState, Enforcement, EntityContent, Fields,
        RegistryRecord, RelationshipKind, SemanticVersion,
    };

    use super::*;

    async fn seed(store: &MemoryStore, content: EntityContent, energy: Option<f64>) -> EntityId {
        let id = EntityId::new();
        let derived = energy.map(|e| {
            let mut payload = DerivedPayload::default();
            payload.scalars.insert("energy".to_owned(), e);
            DerivedState {
                entity_id: id,
                version_number: 1,
                payload,
                last_updated: Utc::now(),
            }
        });
        let batch = CommitBatch {
            registry: Some(RegistryRecord {
                entity_id: id,
                entity_type: content.entity_type(),
                created_at: Utc::now(),
            }),
            version: SemanticVersion {
                entity_id: id,
                version_number: 1,
                effective_at: Utc::now(),
                created_at: Utc::now(),
                content,
                change_reason: "created".to_owned(),
            },
            derived,
            guards: Vec::new(),
            workflow: None,
        };
        store.commit_atomic(&batch).await.unwrap();
        id
    }

    fn thread(name: &str) -> EntityContent {
        EntityContent::Thread {
            name: name.to_owned(),
            fields: Fields::new(),
        }
    }

    fn partner(a: EntityId, b: EntityId) -> EntityContent {
        EntityContent::Bond {
            endpoints: [a, b],
            kind: RelationshipKind::new("partner"),
            fields: Fields::new(),
        }
    }

    #[tokio::test]
    async fn failures_are_reported_in_order() {
        let store = MemoryStore::new();
        let active = seed(
            &store,
            thread("Mary").with_field("status", json!("active")),
            Some(0.2),
        )
        .await;
        let ghost = EntityId::new();

        let preconditions = vec![
            Precondition::exists("ghost_exists", ghost),
            Precondition::lifecycle("is_active", active, "status", json!("active")),
            Precondition::threshold("energetic", active, "energy", Comparator::Ge, 0.5),
            Precondition::threshold("has_mass", active, "mass", Comparator::Gt, 0.0),
        ];
        let report = check_once(&store, &preconditions, &[]).await.unwrap();

        let names: Vec<&str> = report.failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["ghost_exists", "energetic", "has_mass"]);
        assert_eq!(report.failures[0].reason, FailureReason::Missing);
        assert!(matches!(
            report.failures[1].reason,
            FailureReason::ThresholdNotMet { .. }
        ));
        assert_eq!(
            report.failures[2].reason,
            FailureReason::FieldAbsent {
                field: "mass".to_owned()
            }
        );
        assert_eq!(report.version_of(active), 1);
        assert_eq!(report.version_of(ghost), 0);
    }

    #[tokio::test]
    async fn cardinality_counts_active_bonds() {
        let store = MemoryStore::new();
        let a = seed(&store, thread("A"), None).await;
        let b = seed(&store, thread("B"), None).await;
        let c = seed(&store, thread("C"), None).await;
        seed(&store, partner(a, b), None).await;
        seed(&store, partner(a, c).with_field("status", json!("retired")), None).await;

        let limit = |n| {
            vec![
                Precondition::cardinality("a_partner", a, RelationshipKind::new("partner"), n)
                    .with_enforcement(Enforcement::Soft),
            ]
        };
        let at_limit = check_once(&store, &limit(1), &[]).await.unwrap();
        assert_eq!(
            at_limit.failures[0].reason,
            FailureReason::LimitReached {
                kind: RelationshipKind::new("partner"),
                count: 1,
                limit: 1
            }
        );
        assert!(at_limit.guards.contains(&CommitGuard::Tally {
            entity_id: a,
            kind: RelationshipKind::new("partner"),
            expected: 1
        }));

        assert!(check_once(&store, &limit(2), &[]).await.unwrap().passed());
    }

    #[tokio::test]
    async fn retired_entities_do_not_exist() {
        let store = MemoryStore::new();
        let gone = seed(&store, thread("Old").with_field("status", json!("retired")), None).await;
        let report = check_once(&store, &[Precondition::exists("x", gone)], &[])
            .await
            .unwrap();
        assert_eq!(report.failures[0].reason, FailureReason::Missing);
        assert_eq!(report.failures[0].target, gone);
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let a = seed(&store, thread("A"), None).await;
        let (batcher, _task) = CheckBatcher::spawn(store.clone(), 64, 128);

        let checks = (0..10).map(|i| {
            let batcher = batcher.clone();
            async move {
                batcher
                    .check(vec![Precondition::exists(format!("c{i}"), a)], Vec::new())
                    .await
            }
        });
        let results = futures::future::join_all(checks).await;

        assert!(results.iter().all(|r| r.as_ref().is_ok_and(CheckReport::passed)));
        assert_eq!(store.snapshot_reads(), 1);
    }

    #[tokio::test]
    async fn snapshot_failure_reaches_every_waiter() {
        let store = Arc::new(MemoryStore::new());
        let (batcher, _task) = CheckBatcher::spawn(store.clone(), 8, 8);
        store.fail_next(1);

        let err = batcher
            .check(vec![Precondition::exists("x", EntityId::new())], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Snapshot { transient: true, .. }));
    }
}
