//! Track model and its pull/push state machines
//!
//! `pull_state` only ever advances `NotPulled -> Pulling -> {Pulled | Failed}`.
//! The single way back is [`Track::reset_pull`], used for an explicit retry.

use relaycall_proto::{QualifiedTrackId, TrackKind, TrackState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::id::{SessionId, TrackId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum PullState {
    NotPulled,
    Pulling,
    Pulled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum PushState {
    NotPushed,
    Pushing,
    Pushed,
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Track {track_id}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub track_id: TrackId,
    pub from: &'static str,
    pub to: &'static str,
}

impl PullState {
    const fn name(&self) -> &'static str {
        match self {
            Self::NotPulled => "notPulled",
            Self::Pulling => "pulling",
            Self::Pulled => "pulled",
            Self::Failed(_) => "failed",
        }
    }
}

impl PushState {
    const fn name(&self) -> &'static str {
        match self {
            Self::NotPushed => "notPushed",
            Self::Pushing => "pushing",
            Self::Pushed => "pushed",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    /// Relay session that publishes this track
    pub session_id: Option<SessionId>,
    pub kind: TrackKind,
    pub state: TrackState,
    pull_state: PullState,
    push_state: PushState,
    mid: Option<String>,
}

impl Track {
    /// A track announced by the signaling feed
    #[must_use]
    pub fn remote(id: QualifiedTrackId, kind: TrackKind, state: TrackState) -> Self {
        let (session_id, track_id) = id.into_parts();
        Self {
            id: TrackId::new(track_id),
            session_id: Some(SessionId::new(session_id)),
            kind,
            state,
            pull_state: PullState::NotPulled,
            push_state: PushState::NotPushed,
            mid: None,
        }
    }

    /// A track published from this device
    #[must_use]
    pub fn local(id: TrackId, session_id: SessionId, kind: TrackKind) -> Self {
        Self {
            id,
            session_id: Some(session_id),
            kind,
            state: TrackState::Inactive,
            pull_state: PullState::NotPulled,
            push_state: PushState::NotPushed,
            mid: None,
        }
    }

    #[must_use]
    pub const fn pull_state(&self) -> &PullState {
        &self.pull_state
    }

    #[must_use]
    pub const fn push_state(&self) -> &PushState {
        &self.push_state
    }

    #[must_use]
    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    #[must_use]
    pub fn qualified_id(&self) -> Option<QualifiedTrackId> {
        self.session_id
            .as_ref()
            .map(|session| QualifiedTrackId::new(session.as_str(), self.id.as_str()))
    }

    /// `NotPulled -> Pulling`. Returns `false` (and changes nothing) from any
    /// other state, which is what keeps a track from being pulled twice.
    pub fn begin_pull(&mut self) -> bool {
        if self.pull_state == PullState::NotPulled {
            self.pull_state = PullState::Pulling;
            true
        } else {
            false
        }
    }

    /// `Pulling -> Pulled`, recording the negotiated mid
    pub fn complete_pull(&mut self, mid: Option<String>) -> Result<(), InvalidTransition> {
        self.expect_pulling("pulled")?;
        self.pull_state = PullState::Pulled;
        self.mid = mid;
        Ok(())
    }

    /// `Pulling -> Failed(reason)`
    pub fn fail_pull(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.expect_pulling("failed")?;
        self.pull_state = PullState::Failed(reason.into());
        Ok(())
    }

    /// Explicit reset of a settled pull back to `NotPulled`
    pub fn reset_pull(&mut self) -> bool {
        match self.pull_state {
            PullState::Pulled | PullState::Failed(_) => {
                self.pull_state = PullState::NotPulled;
                self.mid = None;
                true
            }
            PullState::NotPulled | PullState::Pulling => false,
        }
    }

    /// Move the track to another publishing session. Any pull progress
    /// belonged to the old session, so the track starts over at `NotPulled`.
    pub fn rebind_session(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
        if self.pull_state != PullState::NotPulled {
            self.pull_state = PullState::NotPulled;
            self.mid = None;
        }
    }

    pub fn begin_push(&mut self) -> bool {
        if self.push_state == PushState::NotPushed {
            self.push_state = PushState::Pushing;
            true
        } else {
            false
        }
    }

    pub fn complete_push(&mut self, mid: Option<String>) -> Result<(), InvalidTransition> {
        if self.push_state != PushState::Pushing {
            return Err(self.invalid_push("pushed"));
        }
        self.push_state = PushState::Pushed;
        self.mid = mid;
        Ok(())
    }

    pub fn fail_push(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.push_state != PushState::Pushing {
            return Err(self.invalid_push("failed"));
        }
        self.push_state = PushState::Failed(reason.into());
        Ok(())
    }

    fn expect_pulling(&self, to: &'static str) -> Result<(), InvalidTransition> {
        if self.pull_state == PullState::Pulling {
            Ok(())
        } else {
            Err(InvalidTransition {
                track_id: self.id.clone(),
                from: self.pull_state.name(),
                to,
            })
        }
    }

    fn invalid_push(&self, to: &'static str) -> InvalidTransition {
        InvalidTransition {
            track_id: self.id.clone(),
            from: self.push_state.name(),
            to,
        }
    }
}
