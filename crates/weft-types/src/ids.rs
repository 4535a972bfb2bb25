//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Domain entities, workflows and bus events each get their own id type so
//! they cannot be mixed up at compile time. All ids use UUID v7
//! (time-ordered) which keeps registry and log indexes append-friendly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a domain entity (registry row).
    ///
    /// Relationships are Bond entities and share this id space.
    EntityId
}

define_id! {
    /// Unique identifier for an interactive resolution workflow.
    WorkflowId
}

define_id! {
    /// Unique identifier for an event published on the bus.
    EventId
}

impl EntityId {
    /// Stable 32-bit hash of the id, taken from the last four UUID bytes.
    ///
    /// The leading bytes of a v7 id are a timestamp, so only the trailing
    /// random bytes spread evenly. Used for partition assignment and
    /// deterministic placement.
    pub fn stable_hash(&self) -> u32 {
        let bytes = self.0.as_bytes();
        u32::from_be_bytes([
            *bytes.get(12).unwrap_or(&0),
            *bytes.get(13).unwrap_or(&0),
            *bytes.get(14).unwrap_or(&0),
            *bytes.get(15).unwrap_or(&0),
        ])
    }
}

/// A slice of the entity id space owned by one simulation process.
///
/// An entity belongs to partition `stable_hash % count`. With `count <= 1`
/// every entity belongs to partition 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Zero-based partition index.
    pub index: u32,
    /// Total number of partitions.
    pub count: u32,
}

impl Partition {
    /// The single partition covering every entity.
    pub const ALL: Self = Self { index: 0, count: 1 };

    /// Whether `entity_id` falls into this partition.
    pub fn contains(&self, entity_id: &EntityId) -> bool {
        if self.count <= 1 {
            return true;
        }
        entity_id.stable_hash().wrapping_rem(self.count) == self.index
    }
}
