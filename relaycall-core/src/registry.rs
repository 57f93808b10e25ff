//! Participant registry
//!
//! Locally cached, authoritative view of every call participant and their
//! tracks, merged from `userState` updates in the order they arrive.
//!
//! Merge rules:
//! - unknown participant: inserted with all of its tracks
//! - known participant: `state` and `transceiver_session_id` overwritten in place
//! - unknown track id: inserted with `pull_state = NotPulled`
//! - known track id: only `state` is updated; pull/push progress and `mid` survive
//! - known track id under a new session prefix: rebound to that session and
//!   pulled again

use indexmap::IndexMap;
use relaycall_proto::signaling::{RemoteParticipant, TrackDescriptor};
use relaycall_proto::{ParticipantRole, ProtoError, QualifiedTrackId};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::MembershipPolicy;
use crate::models::{Participant, ParticipantId, SessionId, Track, TrackId};

/// A track that could not be merged because its wire id is malformed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTrack {
    pub participant_id: ParticipantId,
    pub raw_id: String,
    pub error: ProtoError,
}

/// What one `apply_update` changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub inserted: Vec<ParticipantId>,
    /// Known participants whose state, session or tracks actually changed
    pub updated: Vec<ParticipantId>,
    /// Only populated under [`MembershipPolicy::Prune`]
    pub removed: Vec<Participant>,
    pub rejected_tracks: Vec<RejectedTrack>,
}

impl RegistryDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.rejected_tracks.is_empty()
    }

    /// Whether registry content changed
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: IndexMap<ParticipantId, Participant>,
    policy: MembershipPolicy,
}

impl ParticipantRegistry {
    #[must_use]
    pub fn new(policy: MembershipPolicy) -> Self {
        Self {
            participants: IndexMap::new(),
            policy,
        }
    }

    /// Merge one `userState` participant list
    pub fn apply_update(&mut self, remote: &[RemoteParticipant]) -> RegistryDiff {
        let mut diff = RegistryDiff::default();
        let mut mentioned = HashSet::with_capacity(remote.len());

        for incoming in remote {
            let id = ParticipantId::new(incoming.id.as_str());
            mentioned.insert(id.clone());

            match self.participants.get_mut(&id) {
                Some(existing) => {
                    if merge_participant(existing, incoming, &mut diff.rejected_tracks)
                        && !diff.inserted.contains(&id)
                        && !diff.updated.contains(&id)
                    {
                        diff.updated.push(id);
                    }
                }
                None => {
                    let mut participant = Participant::new(id.clone(), incoming.role, incoming.state);
                    participant
                        .transceiver_session_id
                        .clone_from(&incoming.transceiver_session_id);
                    merge_tracks(&mut participant, &incoming.tracks, &mut diff.rejected_tracks);

                    debug!(
                        participant_id = %id,
                        role = ?incoming.role,
                        tracks = participant.tracks.len(),
                        "Participant inserted"
                    );
                    self.participants.insert(id.clone(), participant);
                    diff.inserted.push(id);
                }
            }
        }

        if self.policy == MembershipPolicy::Prune {
            let absent: Vec<ParticipantId> = self
                .participants
                .keys()
                .filter(|id| !mentioned.contains(*id))
                .cloned()
                .collect();
            for id in absent {
                if let Some(removed) = self.remove(&id) {
                    diff.removed.push(removed);
                }
            }
        }

        for rejected in &diff.rejected_tracks {
            warn!(
                participant_id = %rejected.participant_id,
                raw_id = %rejected.raw_id,
                error = %rejected.error,
                "Rejected track with malformed id"
            );
        }

        diff
    }

    /// Delete a participant; in-flight pull results for its tracks are discarded on completion
    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let removed = self.participants.shift_remove(id);
        if removed.is_some() {
            debug!(participant_id = %id, "Participant removed");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participants_with_role(
        &self,
        role: ParticipantRole,
    ) -> impl Iterator<Item = &Participant> {
        self.participants.values().filter(move |p| p.role == role)
    }

    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn participants_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.values_mut()
    }

    /// Add a participant this client knows about before the feed reports it
    pub fn insert(&mut self, participant: Participant) {
        self.participants
            .entry(participant.id.clone())
            .or_insert(participant);
    }

    /// First track with this bare id, together with its owner
    #[must_use]
    pub fn track(&self, id: &TrackId) -> Option<(&Participant, &Track)> {
        self.participants
            .values()
            .find_map(|p| p.track(id).map(|t| (p, t)))
    }

    pub fn track_mut(&mut self, participant: &ParticipantId, track: &TrackId) -> Option<&mut Track> {
        self.participants.get_mut(participant)?.track_mut(track)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Owned copy for publishing to observers
    #[must_use]
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }
}

/// Returns whether anything changed
fn merge_participant(
    existing: &mut Participant,
    incoming: &RemoteParticipant,
    rejected: &mut Vec<RejectedTrack>,
) -> bool {
    let mut changed = false;

    if existing.state != incoming.state {
        debug!(
            participant_id = %existing.id,
            from = ?existing.state,
            to = ?incoming.state,
            "Participant state changed"
        );
        existing.state = incoming.state;
        changed = true;
    }
    if existing.transceiver_session_id != incoming.transceiver_session_id {
        existing
            .transceiver_session_id
            .clone_from(&incoming.transceiver_session_id);
        changed = true;
    }

    merge_tracks(existing, &incoming.tracks, rejected) || changed
}

fn merge_tracks(
    participant: &mut Participant,
    incoming: &[TrackDescriptor],
    rejected: &mut Vec<RejectedTrack>,
) -> bool {
    let mut changed = false;
    let owner = participant.id.clone();

    for descriptor in incoming {
        let qualified = match QualifiedTrackId::parse(&descriptor.id) {
            Ok(q) => q,
            Err(error) => {
                rejected.push(RejectedTrack {
                    participant_id: owner.clone(),
                    raw_id: descriptor.id.clone(),
                    error,
                });
                continue;
            }
        };

        let track_id = TrackId::new(qualified.track_id());
        match participant.track_mut(&track_id) {
            Some(track) => {
                if track.state != descriptor.state {
                    track.state = descriptor.state;
                    changed = true;
                }
                let session_id = SessionId::new(qualified.session_id());
                if track.session_id.as_ref() != Some(&session_id) {
                    debug!(
                        participant_id = %owner,
                        track_id = %track_id,
                        session_id = %session_id,
                        "Track re-announced under a new session"
                    );
                    track.rebind_session(session_id);
                    changed = true;
                }
            }
            None => {
                participant
                    .tracks
                    .push(Track::remote(qualified, descriptor.kind, descriptor.state));
                changed = true;
            }
        }
    }

    changed
}
