//! Event bus for the Weft semantic store.
//!
//! Topics carry JSON envelopes (see [`weft_types::events`]). The bus is the
//! only channel between the commit service, the physics processor and the
//! spatial cache of every process.
//!
//! # Modules
//!
//! - [`bus`] -- The [`EventBus`] port and publish-with-retry
//! - [`nats`] -- Core-NATS adapter
//! - [`memory`] -- In-process broadcast adapter
//! - [`error`] -- Shared error types

pub mod bus;
pub mod error;
pub mod memory;
pub mod nats;

pub use bus::{EventBus, MessageStream, RawMessage, publish_with_retry};
pub use error::BusError;
pub use memory::InMemoryBus;
pub use nats::NatsEventBus;
