//! The event bus port.
//!
//! Delivery is at-least-once: consumers must be idempotent, keyed by
//! `(entity_id, version_number)`. Ordering is only guaranteed per publisher
//! connection.

use async_trait::async_trait;
use futures::stream::BoxStream;
use weft_types::retry::retry;
use weft_types::{DomainEvent, EventEnvelope, RetryPolicy};

use crate::error::BusError;

/// A message as it came off the wire, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Subject (equal to the event topic).
    pub subject: String,
    /// JSON envelope bytes.
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Decode into a typed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`weft_types::DecodeError`] for unknown subjects or
    /// malformed payloads.
    pub fn decode(&self) -> Result<EventEnvelope, weft_types::DecodeError> {
        EventEnvelope::decode(&self.subject, &self.payload)
    }
}

/// Stream of raw messages for a subscription.
pub type MessageStream = BoxStream<'static, RawMessage>;

/// Publish/subscribe transport shared by every process.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish pre-encoded bytes on `subject`.
    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to every subject in `topics`. Only messages published
    /// after this call returns are guaranteed to be delivered.
    async fn subscribe(&self, topics: &[&str]) -> Result<MessageStream, BusError>;

    /// Wrap `event` in a fresh envelope and publish it once.
    async fn publish(&self, event: &DomainEvent) -> Result<EventEnvelope, BusError> {
        let envelope = EventEnvelope::wrap(event.clone());
        let (subject, payload) = envelope.encode()?;
        self.publish_raw(subject, payload).await?;
        Ok(envelope)
    }
}

/// Publish `event`, retrying transient failures per `policy`.
///
/// Every attempt carries the same envelope, so a redelivered copy is
/// indistinguishable from the original.
///
/// # Errors
///
/// Returns [`BusError::EventDeliveryFailure`] once the budget is spent or a
/// permanent error occurs, and [`BusError::Serialization`] if the event
/// cannot be encoded.
pub async fn publish_with_retry(
    bus: &dyn EventBus,
    event: &DomainEvent,
    policy: &RetryPolicy,
) -> Result<EventEnvelope, BusError> {
    let envelope = EventEnvelope::wrap(event.clone());
    let (subject, payload) = envelope.encode()?;

    let bytes = &payload;
    let result = retry(policy, "event_publish", BusError::is_transient, move || async move {
        bus.publish_raw(subject, bytes.clone()).await
    })
    .await;

    match result {
        Ok(()) => {
            tracing::debug!(
                topic = subject,
                event_id = %envelope.event_id,
                entity_id = %event.entity_id(),
                "Published event"
            );
            Ok(envelope)
        }
        Err(e) => {
            tracing::error!(
                topic = subject,
                entity_id = %event.entity_id(),
                error = %e,
                "Event delivery failed; durable state is unaffected"
            );
            Err(BusError::EventDeliveryFailure {
                topic: subject.to_owned(),
                reason: e.to_string(),
            })
        }
    }
}
