use serde::Serialize;
use std::fmt;

use crate::error::Error;
use crate::models::{Participant, Session};

/// Lifecycle of one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    Uninitialized,
    SessionCreated,
    Negotiating,
    Active,
    Ended,
}

impl CallState {
    /// Legal forward transitions; any state may end
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::SessionCreated)
                | (Self::SessionCreated, Self::Negotiating)
                | (Self::Negotiating, Self::Active)
                | (
                    Self::Uninitialized | Self::SessionCreated | Self::Negotiating | Self::Active,
                    Self::Ended
                )
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::SessionCreated => "sessionCreated",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The feed reported `call: null`
    Remote,
    Declined,
    Left,
    Failed(Error),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("ended by relay"),
            Self::Declined => f.write_str("declined"),
            Self::Left => f.write_str("left"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Immutable view of the call published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub session: Option<Session>,
    pub participants: Vec<Participant>,
    pub last_error: Option<Error>,
    pub end_reason: Option<EndReason>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Uninitialized,
            session: None,
            participants: Vec::new(),
            last_error: None,
            end_reason: None,
        }
    }
}
