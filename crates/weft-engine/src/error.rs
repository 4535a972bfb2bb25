//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup and of the
//! background tasks, so `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: weft_core::ConfigError,
    },

    /// The durable store could not be reached or migrated.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: weft_db::DbError,
    },

    /// The event bus could not be reached.
    #[error("bus error: {source}")]
    Bus {
        /// The underlying bus error.
        #[from]
        source: weft_events::BusError,
    },

    /// Cache hydration or live-sync failed.
    #[error("cache error: {source}")]
    Cache {
        /// The underlying cache error.
        #[from]
        source: weft_cache::CacheError,
    },

    /// A core service failed to start.
    #[error("core error: {source}")]
    Core {
        /// The underlying core error.
        #[from]
        source: weft_core::CoreError,
    },

    /// The command intake could not subscribe.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// A background task panicked or was aborted.
    #[error("task '{task}' failed: {message}")]
    Task {
        /// Which task.
        task: &'static str,
        /// Join error description.
        message: String,
    },
}

/// Why a single intake command could not be served.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// The subject names no known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The payload is not a valid command body.
    #[error("malformed command: {0}")]
    Decode(#[source] serde_json::Error),

    /// The reply could not be serialized.
    #[error("failed to encode reply: {0}")]
    Encode(#[source] serde_json::Error),

    /// The commit service refused or failed the command.
    #[error(transparent)]
    Core(#[from] weft_core::CoreError),
}

impl IntakeError {
    /// Whether the caller may retry the same command.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Core(e) => e.is_transient(),
            _ => false,
        }
    }
}
