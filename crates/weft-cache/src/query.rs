//! Read-only view of the spatial cache for the numeric collaborator.

use weft_types::{Coordinates, DerivedState, EntityId};

use crate::index::Neighbor;

/// Spatial queries served from process-local memory.
///
/// Implementations never touch the durable store and never block on I/O.
pub trait SpatialQuery: Send + Sync {
    /// The `k` nearest indexed entities to `point`, nearest first.
    fn nearest(&self, point: &Coordinates, k: usize) -> Vec<Neighbor>;

    /// Every indexed entity within `radius` of `point`, nearest first.
    fn within_radius(&self, point: &Coordinates, radius: f64) -> Vec<Neighbor>;

    /// The cached derived row for `entity_id`.
    fn get(&self, entity_id: EntityId) -> Option<DerivedState>;

    /// Number of indexed entities.
    fn node_count(&self) -> usize;

    /// Hydration generation; bumps on every (re-)hydration.
    fn generation(&self) -> u64;
}
