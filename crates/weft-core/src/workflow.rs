//! Interactive resolution workflows.
//!
//! When a checked intent fails, the commit service parks it in a
//! [`WorkflowRecord`]. This module decides what to ask the human for,
//! folds answers back into the draft, and reclaims abandoned workflows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use weft_db::{DbError, DurableStore};
use weft_types::workflow::{override_field, substitute_field};
use weft_types::{
    Answers, ConditionFailure, Enforcement, EntityId, FailureReason, InputRequest, InputShape,
    WorkflowRecord, WorkflowResult, WorkflowStatus, WriteIntent,
};

use crate::config::WorkflowConfig;
use crate::error::{CoreError, ValidationError};
use crate::validation::parse_entity_ref;

/// Workflow type for entity writes with failing preconditions.
pub const ENTITY_WRITE: &str = "entity_write";
/// Workflow type for relationship proposals.
pub const RELATIONSHIP_PROPOSAL: &str = "relationship_proposal";

/// Reason recorded on workflows reclaimed by the [`Janitor`].
pub const ABANDONED: &str = "abandoned";

/// What the current answers mean for a set of failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every failure is lifted by an answer; the intent may commit.
    Clear,
    /// Some failures can be resolved by the human.
    NeedsInput(Vec<InputRequest>),
    /// Some failure can never be resolved.
    Blocked(String),
}

/// Weigh `failures` against `answers`.
///
/// - A `Soft` failure is lifted by `override.<name> = true`; `false` blocks.
/// - A `Hard` failure whose target is missing asks for a substitute entity.
/// - Any other `Hard` failure blocks.
pub fn assess(failures: &[ConditionFailure], answers: &Answers) -> Verdict {
    let mut requests = Vec::new();
    for failure in failures {
        match (failure.enforcement, &failure.reason) {
            (Enforcement::Soft, _) => {
                let field = override_field(&failure.name);
                match answers.get(&field).and_then(serde_json::Value::as_bool) {
                    Some(true) => {}
                    Some(false) => {
                        return Verdict::Blocked(format!("override of '{}' declined", failure.name));
                    }
                    None => requests.push(InputRequest {
                        prompt: format!("{} Proceed anyway?", failure.describe()),
                        field,
                        shape: InputShape::Confirm,
                        condition: failure.name.clone(),
                    }),
                }
            }
            (Enforcement::Hard, FailureReason::Missing) => requests.push(InputRequest {
                field: substitute_field(&failure.name),
                prompt: format!("{} Which existing entity was meant?", failure.describe()),
                shape: InputShape::EntityRef,
                condition: failure.name.clone(),
            }),
            (Enforcement::Hard, _) => return Verdict::Blocked(failure.describe()),
        }
    }
    if requests.is_empty() {
        Verdict::Clear
    } else {
        Verdict::NeedsInput(requests)
    }
}

/// Apply every `substitute.<name>` answer to `intent`.
///
/// The named precondition (and any other precondition on the same target)
/// is re-pointed at the substitute, and so is the draft's reference.
/// Returns how many targets changed.
pub fn apply_substitutions(
    intent: &mut WriteIntent,
    answers: &Answers,
) -> Result<usize, ValidationError> {
    let mut swaps: Vec<(EntityId, EntityId)> = Vec::new();
    for p in &intent.preconditions {
        let field = substitute_field(&p.name);
        if let Some(value) = answers.get(&field) {
            let to = parse_entity_ref(&field, value)?;
            if to != p.target && !swaps.iter().any(|(from, _)| *from == p.target) {
                swaps.push((p.target, to));
            }
        }
    }
    for (from, to) in &swaps {
        for p in &mut intent.preconditions {
            if p.target == *from {
                p.target = *to;
            }
        }
        intent.draft.retarget(*from, *to);
        tracing::debug!(%from, %to, "Substituted entity reference");
    }
    Ok(swaps.len())
}

/// Source of the current time for workflow ageing.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Periodic sweep reclaiming workflows left `Resolving` too long.
///
/// Reclaiming only closes the workflow record; no domain state changes.
/// A workflow closed by someone else between listing and cancelling is
/// left alone.
pub struct Janitor {
    store: Arc<dyn DurableStore>,
    abandon_after: Duration,
    interval: Duration,
    clock: Clock,
}

impl Janitor {
    /// Create a janitor from the workflow settings.
    pub fn new(store: Arc<dyn DurableStore>, config: &WorkflowConfig) -> Self {
        Self {
            store,
            abandon_after: config.abandon_after(),
            interval: config.janitor_interval(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Age workflows against `clock` instead of the system time.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Cancel every workflow created more than `abandon_after` before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if listing or cancelling fails; workflows
    /// cancelled before the failure stay cancelled.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let age = chrono::Duration::from_std(self.abandon_after).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.store.resolving_workflows_older_than(cutoff).await?;
        let mut reclaimed: usize = 0;
        for mut record in stale {
            let closed = record.finish(
                WorkflowStatus::Cancelled,
                WorkflowResult::Cancelled {
                    reason: ABANDONED.to_owned(),
                },
            );
            if !closed {
                continue;
            }
            match self.store.advance_workflow(&record).await {
                Ok(()) => {}
                Err(DbError::WorkflowClosed { .. } | DbError::WorkflowNotFound(_)) => {
                    tracing::debug!(workflow_id = %record.id, "Workflow closed concurrently");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            tracing::info!(
                workflow_id = %record.id,
                workflow_type = record.workflow_type,
                created_at = %record.created_at,
                "Abandoned workflow cancelled"
            );
            reclaimed = reclaimed.saturating_add(1);
        }
        Ok(reclaimed)
    }

    /// [`sweep_at`](Self::sweep_at) with the janitor's clock.
    pub async fn sweep(&self) -> Result<usize, CoreError> {
        self.sweep_at((self.clock)()).await
    }

    /// Sweep every interval until `shutdown` flips to `true`.
    ///
    /// Returns the total number of workflows reclaimed. Failed sweeps are
    /// logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut total: usize = 0;
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            abandon_after_secs = self.abandon_after.as_secs(),
            "Workflow janitor started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.sweep().await {
                    Ok(0) => {}
                    Ok(n) => total = total.saturating_add(n),
                    Err(e) => tracing::warn!(error = %e, "Janitor sweep failed"),
                },
            }
        }
        tracing::info!(reclaimed = total, "Workflow janitor stopped");
        total
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("abandon_after", &self.abandon_after)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
