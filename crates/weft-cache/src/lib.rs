//! Per-process spatial cache for the Weft simulation.
//!
//! The cache is owned by exactly one process, mutated only by that
//! process's live-sync consumer and read only by its query callers. It is
//! disposable: the durable store can always rebuild it.
//!
//! # Modules
//!
//! - [`index`] -- Uniform-grid spatial index
//! - [`cache`] -- [`SpatialCache`] lifecycle and version bookkeeping
//! - [`sync`] -- [`LiveSync`] event consumer
//! - [`query`] -- Read-only [`SpatialQuery`] port
//! - [`error`] -- Shared error types

pub mod cache;
pub mod error;
pub mod index;
pub mod query;
pub mod sync;

pub use cache::{ApplyOutcome, CacheConfig, CachePhase, CacheStats, HydrationReport, SpatialCache};
pub use error::CacheError;
pub use index::{Neighbor, SpatialIndex};
pub use query::SpatialQuery;
pub use sync::{LiveSync, SyncReport};
