//! Durable store for the Weft semantic store.
//!
//! The store owns three relations (an append-only registry, an append-only
//! semantic log, and one mutable derived-state row per entity) plus the
//! resolution workflow records. It is the system of record: the spatial
//! cache and every subscriber can be rebuilt from it.
//!
//! # Architecture
//!
//! ```text
//! CommitService / PhysicsProcessor / SpatialCache
//!     |
//!     +-- DurableStore (trait)
//!         |-- PgStore      (PostgreSQL, multi-process)
//!         +-- MemoryStore  (in-process, fault injection for tests)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- The [`DurableStore`] port and its value types
//! - [`pg_store`] -- `PostgreSQL` adapter
//! - [`memory`] -- In-process adapter
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`error`] -- Shared error types

pub mod error;
pub mod memory;
pub mod pg_store;
pub mod postgres;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use memory::MemoryStore;
pub use pg_store::PgStore;
pub use postgres::{PostgresConfig, PostgresPool};
pub use store::{
    CommitBatch, CommitGuard, CoordinateRange, DerivedFilter, DurableStore, StoreSnapshot,
    TallyMap, UpsertOutcome, count_tallies,
};
