//! Qualified track identifiers
//!
//! On the wire a track is addressed as `"<relaySessionId>/<trackId>"`. The
//! registry only ever stores the bare track id, so every inbound id is split
//! here before lookup.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

const SEPARATOR: char = '/';

/// A track id namespaced by the relay session that owns it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTrackId {
    session_id: String,
    track_id: String,
}

impl QualifiedTrackId {
    pub fn new(session_id: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            track_id: track_id.into(),
        }
    }

    /// Split a wire id at the first `/`.
    ///
    /// Both halves must be non-empty. The track half may itself contain `/`.
    pub fn parse(raw: &str) -> Result<Self, ProtoError> {
        let Some((session_id, track_id)) = raw.split_once(SEPARATOR) else {
            return Err(ProtoError::MalformedTrackId {
                raw: raw.to_string(),
                reason: "missing '/' separator",
            });
        };

        if session_id.is_empty() {
            return Err(ProtoError::MalformedTrackId {
                raw: raw.to_string(),
                reason: "empty session id",
            });
        }
        if track_id.is_empty() {
            return Err(ProtoError::MalformedTrackId {
                raw: raw.to_string(),
                reason: "empty track id",
            });
        }

        Ok(Self::new(session_id, track_id))
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn into_parts(self) -> (String, String) {
        (self.session_id, self.track_id)
    }
}

impl fmt::Display for QualifiedTrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.session_id, self.track_id)
    }
}

impl FromStr for QualifiedTrackId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
