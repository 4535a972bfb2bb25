//! Live synchronization of the spatial cache from the event bus.
//!
//! [`LiveSync::subscribe`] must be called before
//! [`SpatialCache::initialize`] so that nothing published while the bulk
//! read drains is missed; hydration and live events then overlap safely
//! through the cache's version bookkeeping.

use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::watch;
use weft_events::{EventBus, MessageStream};
use weft_types::events::{TOPIC_DERIVED_COMPLETED, TOPIC_ENTITY_TOMBSTONED};

use crate::cache::{ApplyOutcome, SpatialCache};
use crate::error::CacheError;

/// Counters reported when the consumer loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Events that changed the index.
    pub applied: u64,
    /// Redeliveries, older versions and other partitions.
    pub ignored: u64,
    /// Undecodable or self-inconsistent messages.
    pub dropped: u64,
    /// Full re-hydrations triggered by invariant violations.
    pub rehydrations: u64,
}

/// Default number of applied events between full index checks.
const DEFAULT_VERIFY_EVERY: u64 = 1024;

/// Consumer loop feeding one [`SpatialCache`].
pub struct LiveSync {
    cache: Arc<SpatialCache>,
    stream: MessageStream,
    verify_every: u64,
}

impl LiveSync {
    /// Subscribe to the cache topics.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Subscribe`] if the bus refuses the subscription.
    pub async fn subscribe(cache: Arc<SpatialCache>, bus: &dyn EventBus) -> Result<Self, CacheError> {
        let stream = bus
            .subscribe(&[TOPIC_DERIVED_COMPLETED, TOPIC_ENTITY_TOMBSTONED])
            .await?;
        tracing::info!("Live-sync subscribed");
        Ok(Self {
            cache,
            stream,
            verify_every: DEFAULT_VERIFY_EVERY,
        })
    }

    /// Run a full index check after every `events` applied events
    /// (`0` disables the periodic check).
    #[must_use]
    pub const fn with_verify_every(mut self, events: u64) -> Self {
        self.verify_every = events;
        self
    }

    async fn recover(&mut self, reason: &str, report: &mut SyncReport) -> Result<(), CacheError> {
        tracing::error!(reason, "Cache invariant violated; re-hydrating");
        self.cache.rehydrate().await?;
        report.rehydrations = report.rehydrations.saturating_add(1);
        Ok(())
    }

    /// Consume until `shutdown` flips to `true` or the stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::HydrationFailed`] if a re-hydration after an
    /// invariant violation cannot complete; the process must stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SyncReport, CacheError> {
        let mut report = SyncReport::default();
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                message = self.stream.next() => message,
            };
            let Some(message) = message else {
                tracing::info!("Live-sync stream ended");
                break;
            };

            let envelope = match message.decode() {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(subject = %message.subject, error = %e, "Dropping undecodable event");
                    report.dropped = report.dropped.saturating_add(1);
                    continue;
                }
            };

            match self.cache.apply(&envelope) {
                Ok(ApplyOutcome::Stale | ApplyOutcome::Skipped) => {
                    report.ignored = report.ignored.saturating_add(1);
                }
                Ok(outcome) => {
                    tracing::trace!(
                        entity_id = %envelope.event.entity_id(),
                        ?outcome,
                        "Applied live event"
                    );
                    report.applied = report.applied.saturating_add(1);
                    let due = self.verify_every > 0
                        && report.applied.checked_rem(self.verify_every) == Some(0);
                    if due {
                        if let Err(CacheError::Invariant(reason)) = self.cache.verify() {
                            self.recover(&reason, &mut report).await?;
                        }
                    }
                }
                Err(CacheError::Malformed(reason)) => {
                    tracing::warn!(event_id = %envelope.event_id, reason, "Dropping malformed event");
                    report.dropped = report.dropped.saturating_add(1);
                }
                Err(CacheError::Invariant(reason)) => {
                    self.recover(&reason, &mut report).await?;
                }
                Err(CacheError::ShutDown) => break,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            applied = report.applied,
            ignored = report.ignored,
            dropped = report.dropped,
            rehydrations = report.rehydrations,
            "Live-sync stopped"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for LiveSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSync").field("cache", &self.cache).finish_non_exhaustive()
    }
}
