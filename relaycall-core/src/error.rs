use relaycall_proto::ProtoError;
use thiserror::Error;

/// Failures of the realtime signaling channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Encode error: {0}")]
    Encode(#[from] ProtoError),
}

/// Failures of the relay HTTP API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures reported by the media engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("No peer connection")]
    NoPeerConnection,

    #[error("Description rejected: {0}")]
    Rejected(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether retrying the failed operation could succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout { .. }
                | Self::Signaling(
                    SignalingError::NotConnected
                        | SignalingError::Connect(_)
                        | SignalingError::Send(_)
                )
                | Self::Relay(RelayError::Transport(_))
        )
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
