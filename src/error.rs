//! Emulator Error Types
//!
//! Every failure the policy engine can report. Errors are returned to the
//! caller as typed values; the engine never retries and never coerces bad
//! input to a default.

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    /// Account is not registered
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account name is already taken
    #[error("Account already exists: {0}")]
    AccountExists(String),

    /// User is not registered, or not associated with the account
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Negative or non-finite usage amount
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unparseable instant, or one outside the supported range
    #[error("Invalid time: {0}")]
    InvalidTime(String),

    /// Bad half-life, grace fraction, weight or limit
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Checkpoint name already in use
    #[error("Checkpoint already exists: {0}")]
    DuplicateCheckpoint(String),

    /// No checkpoint with this name
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Snapshot could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EmulatorError {
    /// Stable, machine-readable error kind (used by the CLI's JSON output)
    pub fn kind(&self) -> &'static str {
        match self {
            EmulatorError::AccountNotFound(_) => "account_not_found",
            EmulatorError::AccountExists(_) => "account_exists",
            EmulatorError::UserNotFound(_) => "user_not_found",
            EmulatorError::InvalidUsage(_) => "invalid_usage",
            EmulatorError::InvalidTime(_) => "invalid_time",
            EmulatorError::InvalidConfiguration(_) => "invalid_configuration",
            EmulatorError::DuplicateCheckpoint(_) => "duplicate_checkpoint",
            EmulatorError::CheckpointNotFound(_) => "checkpoint_not_found",
            EmulatorError::Serialization(_) => "serialization",
        }
    }
}
