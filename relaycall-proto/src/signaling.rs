//! Signaling messages
//!
//! Every frame on the realtime socket is a JSON object tagged by `type`.
//! Inbound tags this client does not understand decode to
//! [`InboundMessage::Unknown`] and are dropped by the caller; a known tag with
//! a malformed body is a [`ProtoError`].

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Role of a call participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    User,
}

/// Call membership state of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    None,
    Declined,
    Joined,
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    Audio,
    Video,
    ScreenShare,
}

/// Relay-side activity of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Inactive,
    Requested,
    Active,
}

/// A track as it appears on the wire; `id` is `"<relaySessionId>/<trackId>"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub state: TrackState,
}

/// A participant as reported by the `userState` feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteParticipant {
    pub id: String,
    pub role: ParticipantRole,
    pub state: ParticipantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transceiver_session_id: Option<String>,
    #[serde(default)]
    pub tracks: Vec<TrackDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPayload {
    pub participants: Vec<RemoteParticipant>,
}

/// `state` body of a `userState` message; `call: null` means the call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatePayload {
    pub call: Option<CallPayload>,
}

/// Messages received from the relay's realtime endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "userState")]
    UserState { state: UserStatePayload },

    #[serde(rename = "user-socket-pong")]
    Pong,

    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Strictly decode one text frame
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Local participant state published to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub state: ParticipantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transceiver_session_id: Option<String>,
    pub tracks: Vec<TrackDescriptor>,
}

/// Messages sent to the relay's realtime endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "participantUpdate")]
    ParticipantUpdate { participant: ParticipantUpdate },

    #[serde(rename = "participantJoined")]
    ParticipantJoined,

    #[serde(rename = "user-socket-ping")]
    Ping,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}
