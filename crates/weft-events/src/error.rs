//! Error types for the event bus.

/// Errors that can occur while publishing or subscribing.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The NATS client reported an error.
    #[error("NATS error: {0}")]
    Nats(String),

    /// An event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport is temporarily unable to accept messages.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The bus has been shut down.
    #[error("bus closed")]
    Closed,

    /// Publishing gave up after the retry budget. The durable write that
    /// preceded the publish stands.
    #[error("event delivery failed on {topic}: {reason}")]
    EventDeliveryFailure {
        /// Topic of the undelivered event.
        topic: String,
        /// Last error seen.
        reason: String,
    },
}

impl BusError {
    /// Whether retrying the same publish may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Nats(_) | Self::Unavailable(_))
    }
}
