//! Physics processor host.
//!
//! Consumes `entity.process.v1`, derives numeric state for the entity's
//! current semantic version, upserts it and announces the result on
//! `entity.derived_completed.v1`. The numeric work itself is a pluggable
//! [`DerivationStrategy`]; the host only guarantees idempotence keyed by
//! `(entity_id, version_number)`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt as _;
use tokio::sync::watch;
use weft_db::{DbError, DurableStore, UpsertOutcome};
use weft_events::{EventBus, MessageStream, publish_with_retry};
use weft_types::events::TOPIC_ENTITY_PROCESS;
use weft_types::retry::retry;
use weft_types::{
    Coordinates, DerivedCompleted, DerivedPayload, DerivedState, DomainEvent, EntityContent,
    EntityId, EntityProcess, RetryPolicy,
};

use crate::error::CoreError;

/// A pure function from semantic content to derived state.
///
/// Implementations must be deterministic: the same inputs always yield the
/// same payload, so reprocessing a version is a no-op upsert.
pub trait DerivationStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Derive the payload for one version of `entity_id`.
    fn derive(
        &self,
        entity_id: EntityId,
        content: &EntityContent,
        classification: Option<&serde_json::Value>,
    ) -> DerivedPayload;
}

/// Places entities from classification scores, falling back to a
/// deterministic position spread from the entity id.
///
/// Bonds and retired entities get no position and are never indexed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPlacement;

const AXES: [&str; 3] = ["valence", "arousal", "epistemic"];

/// Map a 10-bit slice of `hash` onto `[-1, 1]`.
fn spread(hash: u32, shift: u32) -> f64 {
    let bits = hash.wrapping_shr(shift) & 0x3ff;
    f64::from(bits) / 1023.0 * 2.0 - 1.0
}

fn number(value: Option<&serde_json::Value>) -> Option<f64> {
    value.and_then(serde_json::Value::as_f64).filter(|v| v.is_finite())
}

impl DerivationStrategy for HashPlacement {
    fn name(&self) -> &'static str {
        "hash_placement"
    }

    fn derive(
        &self,
        entity_id: EntityId,
        content: &EntityContent,
        classification: Option<&serde_json::Value>,
    ) -> DerivedPayload {
        let mut payload = DerivedPayload::default();
        if content.is_retired() {
            return payload;
        }
        let scored = |name: &str| number(classification.and_then(|c| c.get(name)));

        if matches!(content, EntityContent::Bond { .. }) {
            let strength = scored("strength")
                .or_else(|| number(content.field("strength")))
                .unwrap_or(1.0);
            payload.scalars.insert("strength".to_owned(), strength);
            return payload;
        }

        let hash = entity_id.stable_hash();
        let mut coords = [0.0; 3];
        for ((slot, axis), shift) in coords.iter_mut().zip(AXES).zip([20, 10, 0]) {
            *slot = scored(axis).map_or_else(|| spread(hash, shift), |v| v.clamp(-1.0, 1.0));
        }
        payload.position = Some(Coordinates(coords));

        let energy = scored("energy")
            .or_else(|| number(content.field("energy")))
            .unwrap_or(1.0);
        payload.scalars.insert("energy".to_owned(), energy);
        if matches!(content, EntityContent::Wave { .. }) {
            let amplitude = number(content.field("amplitude")).unwrap_or(0.5);
            payload.scalars.insert("amplitude".to_owned(), amplitude);
        }
        payload
    }
}

/// What [`PhysicsProcessor::process`] did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Derived state was written (or already identical) and announced.
    Derived(UpsertOutcome),
    /// The event names an older version than the stored one, or a newer
    /// derived row already exists; nothing written or announced.
    Superseded,
    /// The entity or its semantic version is not in the store.
    Missing,
}

/// Counters reported when the consumer loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    /// Events that produced a derived write.
    pub derived: u64,
    /// Events that were redundant or referenced unknown entities.
    pub skipped: u64,
    /// Undecodable or unexpected messages.
    pub dropped: u64,
    /// Events that failed after retries.
    pub failed: u64,
}

/// Hosts a [`DerivationStrategy`] on the event bus.
pub struct PhysicsProcessor {
    store: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    strategy: Arc<dyn DerivationStrategy>,
    store_retry: RetryPolicy,
    event_retry: RetryPolicy,
}

impl PhysicsProcessor {
    /// Create a processor.
    pub fn new(
        store: Arc<dyn DurableStore>,
        bus: Arc<dyn EventBus>,
        strategy: Arc<dyn DerivationStrategy>,
        store_retry: RetryPolicy,
        event_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            strategy,
            store_retry,
            event_retry,
        }
    }

    /// Derive and store state for the entity named by `event`.
    ///
    /// An event naming an older version than the stored one is superseded:
    /// its classification describes content that no longer exists. When the
    /// store is behind the event, the stored version is derived instead.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if the store keeps failing, or
    /// [`CoreError::Bus`] if the completion event cannot be delivered (the
    /// derived row is durable either way).
    pub async fn process(&self, event: &EntityProcess) -> Result<ProcessOutcome, CoreError> {
        let entity_id = event.entity_id;
        let store = &self.store;
        let view = retry(&self.store_retry, "physics_point_read", DbError::is_transient, || {
            store.point_read(entity_id)
        })
        .await?;
        let Some(current) = view.and_then(|v| v.current) else {
            tracing::warn!(%entity_id, "Process event for unknown entity");
            return Ok(ProcessOutcome::Missing);
        };
        if event.version_number < current.version_number {
            tracing::debug!(
                %entity_id,
                stored = current.version_number,
                announced = event.version_number,
                "Process event overtaken by a newer version"
            );
            return Ok(ProcessOutcome::Superseded);
        }
        if current.version_number < event.version_number {
            tracing::debug!(
                %entity_id,
                stored = current.version_number,
                announced = event.version_number,
                "Store is behind the process event; deriving stored version"
            );
        }

        let started = Instant::now();
        let payload =
            self.strategy
                .derive(entity_id, &current.content, event.classification.as_ref());
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let state = DerivedState {
            entity_id,
            version_number: current.version_number,
            payload,
            last_updated: Utc::now(),
        };

        let state_ref = &state;
        let outcome = retry(&self.store_retry, "physics_upsert", DbError::is_transient, || {
            store.upsert_derived_state(state_ref)
        })
        .await?;
        if outcome == UpsertOutcome::Stale {
            tracing::debug!(%entity_id, version = state.version_number, "Derived state superseded");
            return Ok(ProcessOutcome::Superseded);
        }

        tracing::debug!(
            %entity_id,
            version = state.version_number,
            ?outcome,
            strategy = self.strategy.name(),
            "Derived state written"
        );
        let completed = DomainEvent::DerivedCompleted(DerivedCompleted {
            entity_id,
            derived_state: state,
            duration_ms,
        });
        publish_with_retry(self.bus.as_ref(), &completed, &self.event_retry).await?;
        Ok(ProcessOutcome::Derived(outcome))
    }

    /// Subscribe to `entity.process.v1`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Bus`] if the subscription is refused.
    pub async fn subscribe(&self) -> Result<MessageStream, CoreError> {
        Ok(self.bus.subscribe(&[TOPIC_ENTITY_PROCESS]).await?)
    }

    /// Consume `stream` until `shutdown` flips to `true` or the stream ends.
    ///
    /// Failures are logged per event and never stop the loop.
    pub async fn run(
        self,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProcessorReport {
        let mut report = ProcessorReport::default();
        tracing::info!(strategy = self.strategy.name(), "Physics processor started");
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                message = stream.next() => message,
            };
            let Some(message) = message else {
                tracing::info!("Process stream ended");
                break;
            };

            let event = match message.decode().map(|e| e.event) {
                Ok(DomainEvent::EntityProcess(event)) => event,
                Ok(other) => {
                    tracing::warn!(topic = other.topic(), "Unexpected event on process stream");
                    report.dropped = report.dropped.saturating_add(1);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(subject = %message.subject, error = %e, "Dropping undecodable event");
                    report.dropped = report.dropped.saturating_add(1);
                    continue;
                }
            };

            match self.process(&event).await {
                Ok(ProcessOutcome::Derived(UpsertOutcome::Inserted | UpsertOutcome::Replaced)) => {
                    report.derived = report.derived.saturating_add(1);
                }
                Ok(_) => report.skipped = report.skipped.saturating_add(1),
                Err(e) => {
                    tracing::error!(entity_id = %event.entity_id, error = %e, "Processing failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }
        tracing::info!(
            derived = report.derived,
            skipped = report.skipped,
            dropped = report.dropped,
            failed = report.failed,
            "Physics processor stopped"
        );
        report
    }
}

impl std::fmt::Debug for PhysicsProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsProcessor")
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use serde_json::json;
    use weft_types::{Fields, RelationshipKind, WaveKind};

    use super::*;

    fn focus(text: &str) -> EntityContent {
        EntityContent::Wave {
            kind: WaveKind::Focus,
            text: text.to_owned(),
            fields: Fields::new(),
        }
    }

    #[test]
    fn placement_is_deterministic_and_bounded() {
        let id = EntityId::new();
        let a = HashPlacement.derive(id, &focus("get fit"), None);
        let b = HashPlacement.derive(id, &focus("get fit"), None);
        assert_eq!(a, b);
        let position = a.position.unwrap();
        assert!(position.0.iter().all(|c| (-1.0..=1.0).contains(c)));
        assert_eq!(a.scalar("amplitude"), Some(0.5));
    }

    #[test]
    fn classification_scores_win() {
        let classification = json!({"valence": 0.5, "arousal": 7.0, "energy": 0.25});
        let payload = HashPlacement.derive(EntityId::new(), &focus("x"), Some(&classification));
        let position = payload.position.unwrap();
        assert!((position.0[0] - 0.5).abs() < 1e-12);
        assert!((position.0[1] - 1.0).abs() < 1e-12);
        assert_eq!(payload.scalar("energy"), Some(0.25));
    }

    #[test]
    fn bonds_and_retired_entities_are_not_placed() {
        let bond = EntityContent::Bond {
            endpoints: [EntityId::new(), EntityId::new()],
            kind: RelationshipKind::new("partner"),
            fields: Fields::new(),
        };
        let payload = HashPlacement.derive(EntityId::new(), &bond, None);
        assert!(payload.position.is_none());
        assert_eq!(payload.scalar("strength"), Some(1.0));

        let retired = focus("old").with_field("status", json!("retired"));
        assert_eq!(
            HashPlacement.derive(EntityId::new(), &retired, None),
            DerivedPayload::default()
        );
    }
}
