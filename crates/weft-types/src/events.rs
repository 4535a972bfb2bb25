//! Bus event payloads, topic names and the JSON wire envelope.
//!
//! Every event travels on a subject equal to its topic and is wrapped in an
//! envelope carrying a time-ordered event id and publish timestamp. Consumers
//! key idempotence on `(entity_id, version_number)`, never on the event id,
//! because redelivered and re-emitted events get fresh envelopes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entity::{DerivedState, RelationshipKind};
use crate::enums::EntityType;
use crate::ids::{EntityId, EventId};

/// Fast-path trigger for the physics processor.
pub const TOPIC_ENTITY_PROCESS: &str = "entity.process.v1";
/// Derived state was written; the cache and observers listen for this.
pub const TOPIC_DERIVED_COMPLETED: &str = "entity.derived_completed.v1";
/// A relationship committed through the transactional path.
pub const TOPIC_RELATIONSHIP_CREATED: &str = "relationship.created.v1";
/// An entity left the simulation; the only way a cached node is removed.
pub const TOPIC_ENTITY_TOMBSTONED: &str = "entity.tombstoned.v1";

/// Every topic this crate knows how to decode.
pub const ALL_TOPICS: [&str; 4] = [
    TOPIC_ENTITY_PROCESS,
    TOPIC_DERIVED_COMPLETED,
    TOPIC_RELATIONSHIP_CREATED,
    TOPIC_ENTITY_TOMBSTONED,
];

/// Payload of `entity.process.v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProcess {
    /// The entity to process.
    pub entity_id: EntityId,
    /// Its registry type.
    pub entity_type: EntityType,
    /// The semantic version that triggered processing.
    pub version_number: u64,
    /// Logical time of that version.
    pub effective_at: DateTime<Utc>,
    /// Classification metadata, opaque to the store.
    #[serde(default)]
    pub classification: Option<serde_json::Value>,
}

/// Payload of `entity.derived_completed.v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedCompleted {
    /// The entity whose derived state changed.
    pub entity_id: EntityId,
    /// The derived row as written.
    pub derived_state: DerivedState,
    /// Time spent computing it, in milliseconds.
    pub duration_ms: u64,
}

/// Payload of `relationship.created.v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCreated {
    /// The Bond entity id.
    pub relationship_id: EntityId,
    /// The two related entities.
    pub endpoints: [EntityId; 2],
    /// Relationship class.
    pub kind: RelationshipKind,
    /// Initial derived metrics of the bond.
    #[serde(default)]
    pub initial_metrics: BTreeMap<String, f64>,
}

/// Payload of `entity.tombstoned.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTombstoned {
    /// The removed entity.
    pub entity_id: EntityId,
    /// The semantic version that retired it.
    pub version_number: u64,
}

/// A typed bus event.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// See [`EntityProcess`].
    EntityProcess(EntityProcess),
    /// See [`DerivedCompleted`].
    DerivedCompleted(DerivedCompleted),
    /// See [`RelationshipCreated`].
    RelationshipCreated(RelationshipCreated),
    /// See [`EntityTombstoned`].
    EntityTombstoned(EntityTombstoned),
}

impl DomainEvent {
    /// The topic (and subject) this event is published on.
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::EntityProcess(_) => TOPIC_ENTITY_PROCESS,
            Self::DerivedCompleted(_) => TOPIC_DERIVED_COMPLETED,
            Self::RelationshipCreated(_) => TOPIC_RELATIONSHIP_CREATED,
            Self::EntityTombstoned(_) => TOPIC_ENTITY_TOMBSTONED,
        }
    }

    /// The primary entity the event concerns.
    pub const fn entity_id(&self) -> EntityId {
        match self {
            Self::EntityProcess(e) => e.entity_id,
            Self::DerivedCompleted(e) => e.entity_id,
            Self::RelationshipCreated(e) => e.relationship_id,
            Self::EntityTombstoned(e) => e.entity_id,
        }
    }
}

/// An event together with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Time-ordered id assigned at publish time.
    pub event_id: EventId,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
    /// The event.
    pub event: DomainEvent,
}

impl EventEnvelope {
    /// Wrap `event` in a fresh envelope.
    pub fn wrap(event: DomainEvent) -> Self {
        Self {
            event_id: EventId::new(),
            published_at: Utc::now(),
            event,
        }
    }

    /// Serialize to `(subject, payload)`.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the body cannot be serialized.
    pub fn encode(&self) -> Result<(&'static str, Vec<u8>), serde_json::Error> {
        let payload = match &self.event {
            DomainEvent::EntityProcess(body) => self.encode_body(body)?,
            DomainEvent::DerivedCompleted(body) => self.encode_body(body)?,
            DomainEvent::RelationshipCreated(body) => self.encode_body(body)?,
            DomainEvent::EntityTombstoned(body) => self.encode_body(body)?,
        };
        Ok((self.event.topic(), payload))
    }

    fn encode_body<T: Serialize>(&self, body: &T) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireRef {
            event_id: self.event_id,
            published_at: self.published_at,
            body,
        })
    }

    /// Parse a message received on `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownTopic`] for subjects outside
    /// [`ALL_TOPICS`] and [`DecodeError::Malformed`] for payloads that do
    /// not match the topic's schema.
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        match subject {
            TOPIC_ENTITY_PROCESS => decode_wire(subject, payload, DomainEvent::EntityProcess),
            TOPIC_DERIVED_COMPLETED => {
                decode_wire(subject, payload, DomainEvent::DerivedCompleted)
            }
            TOPIC_RELATIONSHIP_CREATED => {
                decode_wire(subject, payload, DomainEvent::RelationshipCreated)
            }
            TOPIC_ENTITY_TOMBSTONED => {
                decode_wire(subject, payload, DomainEvent::EntityTombstoned)
            }
            other => Err(DecodeError::UnknownTopic(other.to_owned())),
        }
    }
}

/// Why an incoming message could not be turned into a [`DomainEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The subject is not a known topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The payload does not match the topic's schema.
    #[error("malformed payload on {topic}: {source}")]
    Malformed {
        /// The topic the payload arrived on.
        topic: String,
        /// The underlying parse error.
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct WireRef<'a, T> {
    event_id: EventId,
    published_at: DateTime<Utc>,
    body: &'a T,
}

#[derive(Deserialize)]
struct Wire<T> {
    event_id: EventId,
    published_at: DateTime<Utc>,
    body: T,
}

fn decode_wire<T: DeserializeOwned>(
    subject: &str,
    payload: &[u8],
    into_event: fn(T) -> DomainEvent,
) -> Result<EventEnvelope, DecodeError> {
    let wire: Wire<T> = serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed {
        topic: subject.to_owned(),
        source,
    })?;
    Ok(EventEnvelope {
        event_id: wire.event_id,
        published_at: wire.published_at,
        event: into_event(wire.body),
    })
}
