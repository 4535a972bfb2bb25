//! Error types for the spatial cache.

use weft_db::DbError;

/// Errors that can occur while hydrating or applying events.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Hydration exhausted its retry budget. The process cannot serve
    /// queries and must stop.
    #[error("hydration failed: {0}")]
    HydrationFailed(#[source] DbError),

    /// The index and its bookkeeping disagree; a full re-hydration is required.
    #[error("cache invariant violated: {0}")]
    Invariant(String),

    /// An event was well-formed JSON but inconsistent with itself.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// The cache has been shut down.
    #[error("cache is shut down")]
    ShutDown,

    /// Subscribing to the bus failed.
    #[error("subscription failed: {0}")]
    Subscribe(#[from] weft_events::BusError),

    /// Invalid cache configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}
