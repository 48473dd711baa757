//! Error taxonomy for fleet operations.
//!
//! Component boundaries return [`FleetResult`]. Capability traits (strategies,
//! exchanges, stores) return `anyhow::Result` and are folded into
//! [`FleetError::Other`] when they cross a boundary.

use thiserror::Error;

/// Errors surfaced by fleet components.
#[derive(Debug, Error)]
pub enum FleetError {
    /// No bot record exists for the identifier.
    #[error("bot not found: {0}")]
    BotNotFound(String),

    /// A runtime for the bot is already registered.
    #[error("bot {0} is already running")]
    AlreadyRunning(String),

    /// The concurrent-bot limit has been reached.
    #[error("maximum concurrent bots reached ({limit})")]
    LimitReached {
        /// Configured limit.
        limit: usize,
    },

    /// The bot references no credential, or the credential does not exist.
    #[error("exchange credentials missing for bot {0}")]
    MissingCredentials(String),

    /// The referenced credential exists but is disabled.
    #[error("exchange credentials inactive for bot {0}")]
    InactiveCredentials(String),

    /// The operation needs a live runtime.
    #[error("bot {0} is not running")]
    NotRunning(String),

    /// Requested status change is not allowed from the current status.
    #[error("invalid transition for bot {bot_id}: {from} -> {to}")]
    InvalidTransition {
        /// Bot identifier.
        bot_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Strategy lifecycle call failed.
    #[error("strategy error: {0}")]
    Strategy(String),

    /// No factory is registered under the requested name.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rollback requested but no earlier strategy version is known.
    #[error("no previous strategy version for bot {0}")]
    NoRollbackTarget(String),

    /// No snapshot stored for the bot.
    #[error("no snapshot found for bot {0}")]
    SnapshotNotFound(String),

    /// No backup matches the requested selector.
    #[error("no backup found for bot {0}")]
    BackupNotFound(String),

    /// Stored state failed verification or could not be decoded.
    #[error("state corrupted for bot {bot_id}: {detail}")]
    StateCorrupted {
        /// Bot identifier.
        bot_id: String,
        /// What failed.
        detail: String,
    },

    /// Exchange call failed.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Persistence layer failed.
    #[error("database error: {0}")]
    Storage(String),

    /// Operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A critical shutdown step failed.
    #[error("shutdown failed for bot {bot_id}: {detail}")]
    ShutdownFailed {
        /// Bot identifier.
        bot_id: String,
        /// Failed step and cause.
        detail: String,
    },

    /// Anything raised by a capability implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::BotNotFound(_) => "bot_not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::LimitReached { .. } => "limit_reached",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::InactiveCredentials(_) => "inactive_credentials",
            Self::NotRunning(_) => "not_running",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Strategy(_) => "strategy_error",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::Configuration(_) => "configuration_error",
            Self::NoRollbackTarget(_) => "no_rollback_target",
            Self::SnapshotNotFound(_) => "snapshot_not_found",
            Self::BackupNotFound(_) => "backup_not_found",
            Self::StateCorrupted { .. } => "state_corrupted",
            Self::Exchange(_) => "exchange_error",
            Self::Storage(_) => "storage_error",
            Self::Timeout(_) => "timeout",
            Self::ShutdownFailed { .. } => "shutdown_failed",
            Self::Other(_) => "internal_error",
        }
    }

    /// Wraps a store failure, keeping its context chain in the message.
    #[must_use]
    pub fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

/// Result alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;
