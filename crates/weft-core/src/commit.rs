//! The commit service: the single authority deciding how a
//! [`WriteIntent`] becomes durable state.
//!
//! # Write paths
//!
//! ```text
//! WriteIntent
//!     |
//!     +-- no preconditions --> commit semantic row (+ registry) --> ack
//!     |                            |
//!     |                            +-- async: entity.process.v1
//!     |
//!     +-- preconditions ------> CheckBatcher (one snapshot)
//!                                  |-- all hold   --> commit semantic + derived + guards
//!                                  |                  --> derived_completed / relationship.created
//!                                  |-- resolvable --> workflow (AwaitingInput)
//!                                  +-- blocked    --> Rejected, nothing written
//! ```
//!
//! Commit guards pin every version and tally the check observed. A guard
//! failure means a concurrent writer got in between; the full check is
//! re-run up to `commit.revalidation_attempts` times before the intent is
//! reported as contended.
//!
//! Events are published on a background task after the write is durable.
//! Publishing failures are retried and logged but never undo a write.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use weft_db::{CommitBatch, CommitGuard, DbError, DurableStore};
use weft_events::{EventBus, publish_with_retry};
use weft_types::retry::retry;
use weft_types::{
    Answers, CancelWorkflow, ConditionFailure, CreateEntity, DerivedCompleted, DerivedState,
    DomainEvent, EntityContent, EntityId, EntityProcess, EntityTombstoned, InputRequest,
    IntentState, OperationType, Precondition, ProposeRelationship, ProposeResponse,
    ProposeStatus, RETIRED_STATUS, RegistryRecord, RelationshipCreated, RetryPolicy,
    STATUS_FIELD, SemanticVersion, SupplyInput, SupplyInputResponse, SupplyStatus,
    UpdateEntity, WorkflowId, WorkflowRecord, WorkflowResult, WorkflowStatus, WriteIntent,
    WriteResponse, WriteStatus,
};

use crate::checker::{CheckBatcher, CheckReport};
use crate::config::{RelationshipRule, WeftConfig};
use crate::error::{CoreError, ValidationError};
use crate::physics::DerivationStrategy;
use crate::validation::{validate_answers, validate_intent};
use crate::workflow::{self, ENTITY_WRITE, RELATIONSHIP_PROPOSAL, Verdict};

/// How [`CommitService::submit`] disposed of an intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Written without preconditions; derived state follows asynchronously.
    FastPath {
        /// The written entity.
        entity_id: EntityId,
        /// The version that was appended.
        version_number: u64,
    },
    /// Written together with its derived state after every condition held.
    Committed {
        /// The written entity.
        entity_id: EntityId,
        /// The version that was appended.
        version_number: u64,
    },
    /// Some conditions need human input; nothing was written.
    AwaitingInput {
        /// Failing conditions, in precondition order.
        failures: Vec<ConditionFailure>,
        /// Questions resolving them.
        requests: Vec<InputRequest>,
    },
    /// The intent can never commit; nothing was written.
    Rejected {
        /// Failing conditions, in precondition order.
        failures: Vec<ConditionFailure>,
        /// Human-readable cause.
        reason: String,
    },
}

/// Per-intent state machine, logged on every transition.
#[derive(Debug)]
struct Tracker {
    entity_id: EntityId,
    state: IntentState,
}

impl Tracker {
    const fn received(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            state: IntentState::Received,
        }
    }

    const fn resumed(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            state: IntentState::AwaitingInput,
        }
    }

    fn advance(&mut self, next: IntentState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            entity_id = %self.entity_id,
            from = ?self.state,
            to = ?next,
            "Intent transition"
        );
        self.state = next;
        Ok(())
    }
}

/// The commit service.
pub struct CommitService {
    store: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    checker: CheckBatcher,
    strategy: Arc<dyn DerivationStrategy>,
    relationships: BTreeMap<String, RelationshipRule>,
    store_retry: RetryPolicy,
    event_retry: RetryPolicy,
    revalidation_attempts: u32,
}

impl CommitService {
    /// Create a commit service.
    ///
    /// `strategy` derives the state written by transactional commits; it
    /// should be the same strategy the physics processor runs.
    pub fn new(
        store: Arc<dyn DurableStore>,
        bus: Arc<dyn EventBus>,
        checker: CheckBatcher,
        strategy: Arc<dyn DerivationStrategy>,
        config: &WeftConfig,
    ) -> Self {
        Self {
            store,
            bus,
            checker,
            strategy,
            relationships: config.relationships.clone(),
            store_retry: config.commit.store_retry(),
            event_retry: config.commit.event_retry(),
            revalidation_attempts: config.commit.revalidation_attempts,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Handle [`CreateEntity`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a malformed command, or a store
    /// error once retries are exhausted. A failing precondition is not an
    /// error; it is reported in the response.
    pub async fn create_entity(&self, cmd: CreateEntity) -> Result<WriteResponse, CoreError> {
        let intent = WriteIntent {
            operation: OperationType::Create,
            entity_id: None,
            draft: cmd.content,
            effective_at: cmd.effective_at,
            change_reason: "created".to_owned(),
            preconditions: cmd.preconditions,
            metadata: cmd.metadata,
        };
        self.write(intent).await
    }

    /// Handle [`UpdateEntity`]: append a new version to an existing entity.
    ///
    /// # Errors
    ///
    /// As [`create_entity`](Self::create_entity), plus
    /// [`CoreError::NotFound`] when the entity does not exist.
    pub async fn update_entity(&self, cmd: UpdateEntity) -> Result<WriteResponse, CoreError> {
        let intent = WriteIntent {
            operation: OperationType::Update,
            entity_id: Some(cmd.entity_id),
            draft: cmd.content,
            effective_at: None,
            change_reason: cmd.change_reason,
            preconditions: cmd.preconditions,
            metadata: weft_types::IntentMetadata::default(),
        };
        self.write(intent).await
    }

    /// Retire an entity: append a version marked retired and tombstone it.
    ///
    /// Retired bonds stop counting toward relationship tallies and retired
    /// entities leave every spatial cache. Retiring twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] when the entity does not exist.
    pub async fn retire_entity(
        &self,
        entity_id: EntityId,
        reason: &str,
    ) -> Result<WriteResponse, CoreError> {
        let view = self.point_read(entity_id).await?;
        let Some(current) = view.and_then(|v| v.current) else {
            return Err(CoreError::NotFound(entity_id));
        };
        if current.content.is_retired() {
            return Ok(accepted(entity_id));
        }
        let intent = WriteIntent {
            operation: OperationType::TransitionState,
            entity_id: Some(entity_id),
            draft: current
                .content
                .with_field(STATUS_FIELD, serde_json::Value::from(RETIRED_STATUS)),
            effective_at: None,
            change_reason: if reason.trim().is_empty() {
                "retired".to_owned()
            } else {
                reason.to_owned()
            },
            preconditions: Vec::new(),
            metadata: weft_types::IntentMetadata::default(),
        };
        self.write(intent).await
    }

    /// Handle [`ProposeRelationship`].
    ///
    /// Both endpoints must exist. When the relationship kind has a
    /// configured rule, each endpoint must also be under its limit.
    ///
    /// # Errors
    ///
    /// As [`create_entity`](Self::create_entity).
    pub async fn propose_relationship(
        &self,
        cmd: ProposeRelationship,
    ) -> Result<ProposeResponse, CoreError> {
        let [source, target] = cmd.endpoints;
        let rule = self.relationships.get(cmd.kind.as_str()).copied();
        let mut intent = WriteIntent::create(EntityContent::Bond {
            endpoints: cmd.endpoints,
            kind: cmd.kind.clone(),
            fields: cmd.fields,
        })
        .with_precondition(Precondition::exists("source_exists", source))
        .with_precondition(Precondition::exists("target_exists", target));
        if let Some(rule) = rule {
            for (side, id) in [("source", source), ("target", target)] {
                intent = intent.with_precondition(
                    Precondition::cardinality(
                        format!("{side}_{}_limit", cmd.kind),
                        id,
                        cmd.kind.clone(),
                        rule.limit,
                    )
                    .with_enforcement(rule.enforcement),
                );
            }
        }
        intent.metadata.related_ids = vec![source, target];

        let response = self.write(intent).await?;
        Ok(ProposeResponse {
            status: match response.status {
                WriteStatus::Accepted => ProposeStatus::Created,
                WriteStatus::AwaitingInput => ProposeStatus::AwaitingInput,
                WriteStatus::Rejected => ProposeStatus::Rejected,
            },
            relationship_id: response.id,
            workflow_id: response.workflow_id,
            required_input: response.required_input,
            failures: response.failures,
        })
    }

    /// Handle [`SupplyInput`]: merge answers and re-check the parked draft.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WorkflowNotFound`] or [`CoreError::WorkflowClosed`]
    /// for an unknown or finished workflow, [`CoreError::Validation`] for
    /// malformed answers, and store errors once retries are exhausted.
    pub async fn supply_input(&self, cmd: SupplyInput) -> Result<SupplyInputResponse, CoreError> {
        let mut record = self.open_workflow(cmd.workflow_id).await?;
        validate_answers(&cmd.answers, &record.context.draft)?;
        record.context.answers.extend(cmd.answers);

        let mut intent = record.context.draft.clone();
        workflow::apply_substitutions(&mut intent, &record.context.answers)?;
        validate_intent(&intent)?;
        let entity_id = intent
            .entity_id
            .ok_or(ValidationError::MissingTarget("parked"))?;
        record.context.draft = intent.clone();

        // Written by the commit itself, only while the workflow is still open.
        let mut completed = record.clone();
        completed.failures.clear();
        completed.finish(
            WorkflowStatus::Completed,
            WorkflowResult::Committed { entity_id },
        );

        let mut tracker = Tracker::resumed(entity_id);
        tracker.advance(IntentState::Checking)?;
        let submission = self
            .checked(
                &mut tracker,
                &intent,
                &record.context.answers,
                Some(&completed),
            )
            .await?;

        let response = match submission {
            Submission::Committed { entity_id, .. } | Submission::FastPath { entity_id, .. } => {
                record = completed;
                SupplyInputResponse {
                    status: SupplyStatus::Created,
                    workflow_id: record.id,
                    entity_id: Some(entity_id),
                    required_input: Vec::new(),
                    failures: Vec::new(),
                }
            }
            Submission::AwaitingInput { failures, requests } => {
                record.failures.clone_from(&failures);
                record.requests.clone_from(&requests);
                record.updated_at = Utc::now();
                self.advance_workflow(&record).await?;
                SupplyInputResponse {
                    status: SupplyStatus::Continuing,
                    workflow_id: record.id,
                    entity_id: None,
                    required_input: requests,
                    failures,
                }
            }
            Submission::Rejected { failures, reason } => {
                record.failures.clone_from(&failures);
                record.finish(WorkflowStatus::Failed, WorkflowResult::Failed { reason });
                self.advance_workflow(&record).await?;
                SupplyInputResponse {
                    status: SupplyStatus::Failed,
                    workflow_id: record.id,
                    entity_id: None,
                    required_input: Vec::new(),
                    failures,
                }
            }
        };
        tracing::info!(
            workflow_id = %record.id,
            status = record.status.as_str(),
            "Workflow input applied"
        );
        Ok(response)
    }

    /// Handle [`CancelWorkflow`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WorkflowNotFound`] or [`CoreError::WorkflowClosed`].
    pub async fn cancel_workflow(&self, cmd: CancelWorkflow) -> Result<WorkflowRecord, CoreError> {
        let mut record = self.open_workflow(cmd.workflow_id).await?;
        let reason = if cmd.reason.trim().is_empty() {
            "cancelled by caller".to_owned()
        } else {
            cmd.reason
        };
        record.finish(WorkflowStatus::Cancelled, WorkflowResult::Cancelled { reason });
        self.advance_workflow(&record).await?;
        tracing::info!(workflow_id = %record.id, "Workflow cancelled");
        Ok(record)
    }

    /// Load a workflow in any status.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WorkflowNotFound`] for an unknown id.
    pub async fn workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, CoreError> {
        self.store
            .load_workflow(id)
            .await?
            .ok_or(CoreError::WorkflowNotFound(id))
    }

    // =========================================================================
    // Intent pipeline
    // =========================================================================

    /// Run `intent` through validation, the fast or checked path, and commit.
    ///
    /// Assigns `intent.entity_id` for creates, so a parked draft keeps the
    /// same id across resumptions. Opens no workflow; command handlers do.
    ///
    /// # Errors
    ///
    /// See [`create_entity`](Self::create_entity).
    pub async fn submit(&self, intent: &mut WriteIntent) -> Result<Submission, CoreError> {
        validate_intent(intent)?;
        let entity_id = *intent.entity_id.get_or_insert_with(EntityId::new);
        let mut tracker = Tracker::received(entity_id);

        if intent.preconditions.is_empty() {
            let version_number = self.fast_path(intent, entity_id).await?;
            tracker.advance(IntentState::FastPathCommitted)?;
            tracing::info!(
                %entity_id,
                version_number,
                entity_type = %intent.draft.entity_type(),
                "Fast-path write accepted"
            );
            return Ok(Submission::FastPath {
                entity_id,
                version_number,
            });
        }

        tracker.advance(IntentState::Checking)?;
        self.checked(&mut tracker, intent, &Answers::new(), None)
            .await
    }

    async fn write(&self, mut intent: WriteIntent) -> Result<WriteResponse, CoreError> {
        let submission = self.submit(&mut intent).await?;
        Ok(match submission {
            Submission::FastPath { entity_id, .. } | Submission::Committed { entity_id, .. } => {
                accepted(entity_id)
            }
            Submission::AwaitingInput { failures, requests } => {
                let workflow_type = if matches!(intent.draft, EntityContent::Bond { .. }) {
                    RELATIONSHIP_PROPOSAL
                } else {
                    ENTITY_WRITE
                };
                let record =
                    WorkflowRecord::open(workflow_type, intent, failures.clone(), requests.clone());
                self.save_workflow(&record).await?;
                tracing::info!(
                    workflow_id = %record.id,
                    workflow_type,
                    requests = requests.len(),
                    "Intent parked for input"
                );
                WriteResponse {
                    id: None,
                    status: WriteStatus::AwaitingInput,
                    workflow_id: Some(record.id),
                    required_input: requests,
                    failures,
                }
            }
            Submission::Rejected { failures, reason } => {
                tracing::info!(reason, failures = failures.len(), "Intent rejected");
                WriteResponse {
                    id: None,
                    status: WriteStatus::Rejected,
                    workflow_id: None,
                    required_input: Vec::new(),
                    failures,
                }
            }
        })
    }

    /// Write without preconditions and without derived state.
    async fn fast_path(&self, intent: &WriteIntent, entity_id: EntityId) -> Result<u64, CoreError> {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let now = Utc::now();
            let (registry, version_number, guards) = if intent.operation == OperationType::Create {
                let record = RegistryRecord {
                    entity_id,
                    entity_type: intent.draft.entity_type(),
                    created_at: now,
                };
                (Some(record), 1, Vec::new())
            } else {
                let view = self
                    .point_read(entity_id)
                    .await?
                    .ok_or(CoreError::NotFound(entity_id))?;
                check_type(entity_id, view.registry.entity_type, &intent.draft)?;
                let current = view.version_number();
                let guard = CommitGuard::Version {
                    entity_id,
                    expected: current,
                };
                (None, current.saturating_add(1), vec![guard])
            };

            let batch = CommitBatch {
                registry,
                version: new_version(intent, entity_id, version_number),
                derived: None,
                guards,
                workflow: None,
            };
            match self.commit(&batch).await {
                Ok(()) => {
                    let mut events = tombstone_for(intent, &batch);
                    events.push(DomainEvent::EntityProcess(EntityProcess {
                        entity_id,
                        entity_type: batch.version.content.entity_type(),
                        version_number,
                        effective_at: batch.version.effective_at,
                        classification: intent.metadata.classification.clone(),
                    }));
                    self.publish_in_background(events);
                    return Ok(version_number);
                }
                Err(CoreError::Store(DbError::GuardFailed {
                    entity_id: guarded,
                    detail,
                })) => {
                    if attempts > self.revalidation_attempts {
                        return Err(CoreError::Contention {
                            entity_id: guarded,
                            attempts,
                        });
                    }
                    tracing::debug!(%guarded, detail, attempts, "Concurrent update; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check, then commit transactionally or stop for input.
    ///
    /// `closes` is written in the same transaction as the entity, and only
    /// if that workflow is still resolving.
    async fn checked(
        &self,
        tracker: &mut Tracker,
        intent: &WriteIntent,
        answers: &Answers,
        closes: Option<&WorkflowRecord>,
    ) -> Result<Submission, CoreError> {
        let entity_id = tracker.entity_id;
        let extra_ids = if intent.operation == OperationType::Create {
            Vec::new()
        } else {
            vec![entity_id]
        };

        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let report = retry(&self.store_retry, "precondition_check", CoreError::is_transient, || {
                self.checker
                    .check(intent.preconditions.clone(), extra_ids.clone())
            })
            .await?;

            match workflow::assess(&report.failures, answers) {
                Verdict::Clear => {}
                Verdict::NeedsInput(requests) => {
                    tracker.advance(IntentState::AwaitingInput)?;
                    return Ok(Submission::AwaitingInput {
                        failures: report.failures,
                        requests,
                    });
                }
                Verdict::Blocked(reason) => {
                    tracker.advance(IntentState::Rejected)?;
                    return Ok(Submission::Rejected {
                        failures: report.failures,
                        reason,
                    });
                }
            }

            let batch = self.transactional_batch(intent, entity_id, &report, closes)?;
            match self.commit(&batch).await {
                Ok(()) => {
                    tracker.advance(IntentState::Committed)?;
                    let version_number = batch.version.version_number;
                    tracing::info!(
                        %entity_id,
                        version_number,
                        guards = batch.guards.len(),
                        "Checked write committed"
                    );
                    let mut events = tombstone_for(intent, &batch);
                    events.extend(commit_events(&batch));
                    self.publish_in_background(events);
                    return Ok(Submission::Committed {
                        entity_id,
                        version_number,
                    });
                }
                Err(CoreError::Store(DbError::GuardFailed {
                    entity_id: guarded,
                    detail,
                })) => {
                    if attempts > self.revalidation_attempts {
                        tracing::warn!(%guarded, attempts, "Giving up after repeated guard failures");
                        return Err(CoreError::Contention {
                            entity_id: guarded,
                            attempts,
                        });
                    }
                    tracing::info!(%guarded, detail, attempts, "Snapshot raced a commit; re-checking");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transactional_batch(
        &self,
        intent: &WriteIntent,
        entity_id: EntityId,
        report: &CheckReport,
        closes: Option<&WorkflowRecord>,
    ) -> Result<CommitBatch, CoreError> {
        let now = Utc::now();
        let (registry, version_number) = if intent.operation == OperationType::Create {
            let record = RegistryRecord {
                entity_id,
                entity_type: intent.draft.entity_type(),
                created_at: now,
            };
            (Some(record), 1)
        } else {
            let Some(registered) = report.entity_types.get(&entity_id) else {
                return Err(CoreError::NotFound(entity_id));
            };
            check_type(entity_id, *registered, &intent.draft)?;
            (None, report.version_of(entity_id).saturating_add(1))
        };

        let payload = self.strategy.derive(
            entity_id,
            &intent.draft,
            intent.metadata.classification.as_ref(),
        );
        Ok(CommitBatch {
            registry,
            version: new_version(intent, entity_id, version_number),
            derived: Some(DerivedState {
                entity_id,
                version_number,
                payload,
                last_updated: now,
            }),
            guards: report.guards.clone(),
            workflow: closes.cloned(),
        })
    }

    /// `commit_atomic` with transient retries and replay detection.
    ///
    /// A retried commit whose first attempt actually landed reports a
    /// duplicate (or a moved version guard). If the stored version equals
    /// the one being written, the commit is treated as done.
    async fn commit(&self, batch: &CommitBatch) -> Result<(), CoreError> {
        let store = &self.store;
        let result = retry(&self.store_retry, "commit_atomic", DbError::is_transient, || {
            store.commit_atomic(batch)
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_conflict(&e) => {
                if self.landed(batch).await? {
                    tracing::debug!(
                        entity_id = %batch.version.entity_id,
                        version_number = batch.version.version_number,
                        "Commit already landed"
                    );
                    return Ok(());
                }
                let raced = match e {
                    DbError::DuplicateEntity(entity_id) => DbError::GuardFailed {
                        entity_id,
                        detail: "entity was registered concurrently".to_owned(),
                    },
                    DbError::DuplicateVersion {
                        entity_id,
                        version_number,
                    } => DbError::GuardFailed {
                        entity_id,
                        detail: format!("version {version_number} was written concurrently"),
                    },
                    other => other,
                };
                Err(workflow_error(raced))
            }
            Err(e) => Err(workflow_error(e)),
        }
    }

    async fn landed(&self, batch: &CommitBatch) -> Result<bool, CoreError> {
        let history = self.store.version_history(batch.version.entity_id).await?;
        Ok(history.iter().any(|v| {
            v.version_number == batch.version.version_number
                && v.content == batch.version.content
                && v.change_reason == batch.version.change_reason
        }))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn point_read(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<weft_types::EntityView>, CoreError> {
        let store = &self.store;
        retry(&self.store_retry, "point_read", DbError::is_transient, || {
            store.point_read(entity_id)
        })
        .await
        .map_err(CoreError::from)
    }

    async fn open_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, CoreError> {
        let record = self.workflow(id).await?;
        if record.status.is_terminal() {
            return Err(CoreError::WorkflowClosed {
                id,
                status: record.status,
            });
        }
        Ok(record)
    }

    /// Replace an open workflow; fails if it was closed concurrently.
    async fn advance_workflow(&self, record: &WorkflowRecord) -> Result<(), CoreError> {
        let store = &self.store;
        retry(&self.store_retry, "advance_workflow", DbError::is_transient, || {
            store.advance_workflow(record)
        })
        .await
        .map_err(workflow_error)
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), CoreError> {
        let store = &self.store;
        retry(&self.store_retry, "save_workflow", DbError::is_transient, || {
            store.save_workflow(record)
        })
        .await?;
        Ok(())
    }

    /// Publish `events` in order on a background task.
    fn publish_in_background(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        let bus = Arc::clone(&self.bus);
        let policy = self.event_retry;
        tokio::spawn(async move {
            for event in events {
                // Failures are logged inside; the write stays durable.
                let _ = publish_with_retry(bus.as_ref(), &event, &policy).await;
            }
        });
    }
}

impl std::fmt::Debug for CommitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitService")
            .field("strategy", &self.strategy.name())
            .field("relationships", &self.relationships)
            .field("revalidation_attempts", &self.revalidation_attempts)
            .finish_non_exhaustive()
    }
}

fn accepted(entity_id: EntityId) -> WriteResponse {
    WriteResponse {
        id: Some(entity_id),
        status: WriteStatus::Accepted,
        workflow_id: None,
        required_input: Vec::new(),
        failures: Vec::new(),
    }
}

fn new_version(intent: &WriteIntent, entity_id: EntityId, version_number: u64) -> SemanticVersion {
    let now = Utc::now();
    SemanticVersion {
        entity_id,
        version_number,
        effective_at: intent.effective_at.unwrap_or(now),
        created_at: now,
        content: intent.draft.clone(),
        change_reason: intent.change_reason.clone(),
    }
}

fn check_type(
    entity_id: EntityId,
    registered: weft_types::EntityType,
    draft: &EntityContent,
) -> Result<(), ValidationError> {
    let proposed = draft.entity_type();
    if registered == proposed {
        Ok(())
    } else {
        Err(ValidationError::TypeChange {
            entity_id,
            registered,
            proposed,
        })
    }
}

/// A tombstone when `batch` retires an existing entity.
fn tombstone_for(intent: &WriteIntent, batch: &CommitBatch) -> Vec<DomainEvent> {
    if intent.operation != OperationType::Create && batch.version.content.is_retired() {
        vec![DomainEvent::EntityTombstoned(EntityTombstoned {
            entity_id: batch.version.entity_id,
            version_number: batch.version.version_number,
        })]
    } else {
        Vec::new()
    }
}

/// Conflicts that may mean an earlier attempt of the same commit landed.
const fn is_conflict(e: &DbError) -> bool {
    matches!(
        e,
        DbError::DuplicateEntity(_)
            | DbError::DuplicateVersion { .. }
            | DbError::GuardFailed { .. }
            | DbError::WorkflowClosed { .. }
    )
}

/// Surface workflow compare-and-set failures as workflow errors.
fn workflow_error(e: DbError) -> CoreError {
    match e {
        DbError::WorkflowClosed { id, status } => CoreError::WorkflowClosed { id, status },
        DbError::WorkflowNotFound(id) => CoreError::WorkflowNotFound(id),
        other => CoreError::Store(other),
    }
}

/// Events announcing a transactional commit.
fn commit_events(batch: &CommitBatch) -> Vec<DomainEvent> {
    let Some(derived) = &batch.derived else {
        return Vec::new();
    };
    let mut events = Vec::with_capacity(2);
    let created = (batch.registry.is_some(), batch.version.content.bond());
    if let (true, Some((endpoints, kind))) = created {
        events.push(DomainEvent::RelationshipCreated(RelationshipCreated {
            relationship_id: batch.version.entity_id,
            endpoints: *endpoints,
            kind: kind.clone(),
            initial_metrics: derived.payload.scalars.clone(),
        }));
    }
    events.push(DomainEvent::DerivedCompleted(DerivedCompleted {
        entity_id: batch.version.entity_id,
        derived_state: derived.clone(),
        duration_ms: 0,
    }));
    events
}
