use crate::error::Error;
use crate::models::{ParticipantId, TrackId};

use super::state::{CallState, EndReason};

/// Local user actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    /// Join the call: publish local tracks, then pull remote ones
    Accept,
    Decline,
    Leave,
    /// Reset every failed pull and pull again
    RetryFailedPulls,
    /// The capture collaborator added or removed local tracks
    LocalTracksChanged,
}

/// Discrete notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        from: CallState,
        to: CallState,
    },
    ParticipantsChanged {
        inserted: Vec<ParticipantId>,
        updated: Vec<ParticipantId>,
        removed: Vec<ParticipantId>,
    },
    TrackPulled {
        participant_id: ParticipantId,
        track_id: TrackId,
        mid: Option<String>,
    },
    TrackFailed {
        participant_id: ParticipantId,
        track_id: TrackId,
        reason: String,
    },
    /// A failure that did not end the call
    Error(Error),
    Ended(EndReason),
}
