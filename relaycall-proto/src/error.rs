use thiserror::Error;

/// Protocol-level decode failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Malformed track id {raw:?}: {reason}")]
    MalformedTrackId { raw: String, reason: &'static str },
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
