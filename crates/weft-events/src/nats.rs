//! Core-NATS implementation of [`EventBus`].
//!
//! Each topic is its own subject; envelopes are JSON. Core NATS is
//! at-most-once per connection, so publishers retry (see
//! [`publish_with_retry`](crate::publish_with_retry)) and consumers treat
//! redelivery as normal.

use async_trait::async_trait;
use futures::StreamExt as _;
use tracing::{debug, info};
use weft_types::RetryPolicy;
use weft_types::retry::retry;

use crate::bus::{EventBus, MessageStream, RawMessage};
use crate::error::BusError;

/// NATS-backed event bus.
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    /// Connect to a NATS server, retrying per `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Nats`] if the connection cannot be established.
    pub async fn connect(url: &str, policy: &RetryPolicy) -> Result<Self, BusError> {
        info!(url = url, "connecting to NATS server");
        let client = retry(policy, "nats_connect", BusError::is_transient, move || async move {
            async_nats::connect(url)
                .await
                .map_err(|e| BusError::Nats(format!("failed to connect to {url}: {e}")))
        })
        .await?;
        info!("NATS connection established");
        Ok(Self { client })
    }

    /// Wrap an already-connected client.
    pub const fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Flush all pending messages to the server.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Nats`] if the flush fails.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Nats(format!("flush failed: {e}")))
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| BusError::Nats(format!("failed to publish to {subject}: {e}")))
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<MessageStream, BusError> {
        let mut subscribers = Vec::with_capacity(topics.len());
        for topic in topics {
            let subscriber = self
                .client
                .subscribe((*topic).to_owned())
                .await
                .map_err(|e| BusError::Nats(format!("failed to subscribe to {topic}: {e}")))?;
            debug!(subject = topic, "subscribed");
            subscribers.push(subscriber);
        }
        let merged = futures::stream::select_all(subscribers).map(|message| RawMessage {
            subject: message.subject.to_string(),
            payload: message.payload.to_vec(),
        });
        Ok(merged.boxed())
    }
}

impl std::fmt::Debug for NatsEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsEventBus")
            .field("connected", &true)
            .finish()
    }
}
