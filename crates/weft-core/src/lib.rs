//! Write protocol for the Weft semantic store.
//!
//! This crate decides whether a proposed write may become durable state,
//! negotiates missing information with a human when it may not yet, and
//! hosts the numeric collaborator that turns semantic content into derived
//! state.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   |
//!   +-- CommitService ----------+-- DurableStore (commit_atomic, guards)
//!   |     |                     +-- EventBus (process / derived / relationship / tombstone)
//!   |     +-- CheckBatcher -----+-- DurableStore (read_snapshot, batched)
//!   |     +-- workflow ---------+-- DurableStore (workflows)
//!   |
//!   +-- PhysicsProcessor <-- entity.process.v1
//!   +-- Janitor (periodic)
//! ```
//!
//! # Modules
//!
//! - [`config`] -- `weft-config.yaml` loading and typed config
//! - [`validation`] -- Pre-I/O intent and answer validation
//! - [`checker`] -- Snapshot evaluation and request batching
//! - [`commit`] -- The commit service and command handlers
//! - [`workflow`] -- Resolution requests, substitutions, the janitor
//! - [`physics`] -- Derivation strategies and the processor host
//! - [`error`] -- Shared error types

pub mod checker;
pub mod commit;
pub mod config;
pub mod error;
pub mod physics;
pub mod validation;
pub mod workflow;

pub use checker::{CheckBatcher, CheckReport};
pub use commit::{CommitService, Submission};
pub use config::{ConfigError, WeftConfig};
pub use error::{CoreError, ValidationError};
pub use physics::{DerivationStrategy, HashPlacement, PhysicsProcessor, ProcessOutcome};
pub use workflow::{Clock, Janitor, Verdict};
