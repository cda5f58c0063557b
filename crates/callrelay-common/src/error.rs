//! Centralized error types for callrelay.
//!
//! Every per-message failure is reported back to the originating connection as an
//! `error{message, code}` event; the `Display` text becomes `message` and
//! [`RelayError::error_code`] becomes `code`.

/// Core error type used across all callrelay services.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // === Registration errors ===
    #[error("Device ID required")]
    MissingDeviceId,

    #[error("Invalid device ID: {message}")]
    InvalidDeviceId { message: String },

    // === Call routing errors ===
    #[error("Caller not registered")]
    CallerNotRegistered,

    #[error("Not authorized to call this device")]
    Unauthorized,

    #[error("Receiver device not online")]
    ReceiverOffline,

    // === Relay errors ===
    #[error("Relay target not online: {target_id}")]
    UnknownRelayTarget { target_id: String },

    #[error("No active call with {peer_id}")]
    NoActiveCall { peer_id: String },

    #[error("{signal} not allowed in call state {state}")]
    UnexpectedSignal { signal: String, state: String },

    // === Protocol errors ===
    #[error("Invalid message: {detail}")]
    InvalidMessage { detail: String },

    // === Startup errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RelayError {
    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingDeviceId => "MISSING_DEVICE_ID",
            Self::InvalidDeviceId { .. } => "INVALID_DEVICE_ID",
            Self::CallerNotRegistered => "CALLER_NOT_REGISTERED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ReceiverOffline => "RECEIVER_OFFLINE",
            Self::UnknownRelayTarget { .. } => "UNKNOWN_RELAY_TARGET",
            Self::NoActiveCall { .. } => "NO_ACTIVE_CALL",
            Self::UnexpectedSignal { .. } => "UNEXPECTED_SIGNAL",
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::InvalidMessage {
            detail: e.to_string(),
        }
    }
}

/// Convenience type alias for Results using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
