use relaycall_proto::{ParticipantRole, ParticipantState};
use serde::{Deserialize, Serialize};

use super::id::{ParticipantId, TrackId};
use super::track::Track;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: ParticipantRole,
    pub state: ParticipantState,
    pub transceiver_session_id: Option<String>,
    /// Ordered as first announced
    pub tracks: Vec<Track>,
}

impl Participant {
    #[must_use]
    pub fn new(id: ParticipantId, role: ParticipantRole, state: ParticipantState) -> Self {
        Self {
            id,
            role,
            state,
            transceiver_session_id: None,
            tracks: Vec::new(),
        }
    }

    #[must_use]
    pub fn track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| &t.id == id)
    }

    pub fn track_mut(&mut self, id: &TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| &t.id == id)
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.role == ParticipantRole::Host
    }
}
