//! Registry, semantic-log and derived-state records.
//!
//! The three durable relations map one-to-one onto [`RegistryRecord`],
//! [`SemanticVersion`] and [`DerivedState`]. Semantic content is a closed
//! tagged variant per entity category, so the registry's entity type can
//! always be derived from the content it was created with.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{EntityType, ParticleKind, WaveKind};
use crate::ids::EntityId;

/// A point in the 3-dimensional simulation space
/// (`[valence, arousal, epistemic]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coordinates(pub [f64; 3]);

impl Coordinates {
    /// The origin.
    pub const ORIGIN: Self = Self([0.0, 0.0, 0.0]);

    /// Construct from individual axis values.
    pub const fn new(valence: f64, arousal: f64, epistemic: f64) -> Self {
        Self([valence, arousal, epistemic])
    }

    /// Squared Euclidean distance to `other`.
    pub fn distance_squared(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Whether every axis is a finite number.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

/// Class of relationship carried by a Bond entity (e.g. `"partner"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipKind(pub String);

impl RelationshipKind {
    /// Construct from anything string-like.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The kind as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named fields attached to a content payload (e.g. `status`).
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Lifecycle field read by state conditions and retirement.
pub const STATUS_FIELD: &str = "status";

/// Lifecycle value of a retired entity. Retired bonds no longer count
/// toward relationship tallies.
pub const RETIRED_STATUS: &str = "retired";

/// Semantic payload of one version, tagged by entity category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EntityContent {
    /// A discrete occurrence (moment, pulse, intent).
    Particle {
        /// Which particle type.
        kind: ParticleKind,
        /// The recorded text.
        text: String,
        /// Additional named fields.
        #[serde(default)]
        fields: Fields,
    },
    /// A recurring pattern (motif, filament, focus).
    Wave {
        /// Which wave type.
        kind: WaveKind,
        /// The recorded text.
        text: String,
        /// Additional named fields.
        #[serde(default)]
        fields: Fields,
    },
    /// A tracked person, place or concept.
    Thread {
        /// Display name of the thread.
        name: String,
        /// Additional named fields.
        #[serde(default)]
        fields: Fields,
    },
    /// A relationship between two entities.
    Bond {
        /// The two related entities.
        endpoints: [EntityId; 2],
        /// Relationship class.
        kind: RelationshipKind,
        /// Additional named fields.
        #[serde(default)]
        fields: Fields,
    },
}

impl EntityContent {
    /// The registry entity type implied by this content.
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Particle { kind, .. } => match kind {
                ParticleKind::Moment => EntityType::Moment,
                ParticleKind::Pulse => EntityType::Pulse,
                ParticleKind::Intent => EntityType::Intent,
            },
            Self::Wave { kind, .. } => match kind {
                WaveKind::Motif => EntityType::Motif,
                WaveKind::Filament => EntityType::Filament,
                WaveKind::Focus => EntityType::Focus,
            },
            Self::Thread { .. } => EntityType::Thread,
            Self::Bond { .. } => EntityType::Bond,
        }
    }

    /// The named field map.
    pub const fn fields(&self) -> &Fields {
        match self {
            Self::Particle { fields, .. }
            | Self::Wave { fields, .. }
            | Self::Thread { fields, .. }
            | Self::Bond { fields, .. } => fields,
        }
    }

    /// Mutable access to the named field map.
    pub const fn fields_mut(&mut self) -> &mut Fields {
        match self {
            Self::Particle { fields, .. }
            | Self::Wave { fields, .. }
            | Self::Thread { fields, .. }
            | Self::Bond { fields, .. } => fields,
        }
    }

    /// Look up a named field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields().get(name)
    }

    /// Return a copy with `name` set to `value`.
    #[must_use]
    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields_mut().insert(name.to_owned(), value);
        self
    }

    /// The primary human-readable text of this content.
    pub fn headline(&self) -> &str {
        match self {
            Self::Particle { text, .. } | Self::Wave { text, .. } => text,
            Self::Thread { name, .. } => name,
            Self::Bond { kind, .. } => kind.as_str(),
        }
    }

    /// Whether the lifecycle field marks this content as retired.
    pub fn is_retired(&self) -> bool {
        self.field(STATUS_FIELD).and_then(serde_json::Value::as_str) == Some(RETIRED_STATUS)
    }

    /// Endpoints and kind, when this is a Bond.
    pub const fn bond(&self) -> Option<(&[EntityId; 2], &RelationshipKind)> {
        match self {
            Self::Bond {
                endpoints, kind, ..
            } => Some((endpoints, kind)),
            _ => None,
        }
    }

    /// Replace every reference to `from` with `to`. Returns whether anything changed.
    pub fn retarget(&mut self, from: EntityId, to: EntityId) -> bool {
        let mut changed = false;
        if let Self::Bond { endpoints, .. } = self {
            for endpoint in endpoints.iter_mut() {
                if *endpoint == from {
                    *endpoint = to;
                    changed = true;
                }
            }
        }
        changed
    }
}

/// A row of the append-only `registry` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Unique entity id.
    pub entity_id: EntityId,
    /// Fixed type tag.
    pub entity_type: EntityType,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// A row of the append-only `semantic_log` relation.
///
/// Immutable once written. The row with the highest `version_number` for an
/// entity is its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticVersion {
    /// The entity this version belongs to.
    pub entity_id: EntityId,
    /// Monotonic per-entity version, starting at 1.
    pub version_number: u64,
    /// Logical time the content refers to.
    pub effective_at: DateTime<Utc>,
    /// Physical time the row was written.
    pub created_at: DateTime<Utc>,
    /// Semantic payload.
    pub content: EntityContent,
    /// Why this version exists.
    pub change_reason: String,
}

/// Derived payload computed by the numeric collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedPayload {
    /// Position in simulation space, if the entity is spatially placed.
    #[serde(default)]
    pub position: Option<Coordinates>,
    /// Named derived scalars (energy, amplitude, ...).
    #[serde(default)]
    pub scalars: BTreeMap<String, f64>,
}

impl DerivedPayload {
    /// Look up a named scalar.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }
}

/// A row of the mutable `derived_state` relation (one per entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedState {
    /// The entity this state belongs to.
    pub entity_id: EntityId,
    /// Optimistic counter; equals the semantic version it was derived from.
    pub version_number: u64,
    /// Derived payload.
    pub payload: DerivedPayload,
    /// Last write time.
    pub last_updated: DateTime<Utc>,
}

/// Everything the store knows about one entity at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    /// Registry row.
    pub registry: RegistryRecord,
    /// Current semantic version, if any has been written.
    pub current: Option<SemanticVersion>,
    /// Derived state, if the physics processor has produced one.
    pub derived: Option<DerivedState>,
}

impl EntityView {
    /// Current semantic version number (0 when nothing was appended yet).
    pub fn version_number(&self) -> u64 {
        self.current.as_ref().map_or(0, |v| v.version_number)
    }

    /// Look up a named field on the current semantic content.
    pub fn semantic_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.current.as_ref().and_then(|v| v.content.field(name))
    }

    /// Look up a named scalar on the derived state.
    pub fn derived_scalar(&self, name: &str) -> Option<f64> {
        self.derived.as_ref().and_then(|d| d.payload.scalar(name))
    }
}
