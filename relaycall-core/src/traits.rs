//! Collaborator seams
//!
//! The coordinator only talks to the outside world through these traits.
//! `relaycall-signaling`, `relaycall-relay` and `relaycall-media` provide the
//! production implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;
use relaycall_proto::relay::{SessionDescription, TrackObject, TrackResult, TracksResponse};
use relaycall_proto::{InboundMessage, OutboundMessage, ProtoError, TrackKind};

use crate::error::{NegotiationError, RelayError, SignalingError};
use crate::models::{Credentials, SessionId};

/// Why a signaling connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close (1000); the relay is done with us
    Normal,
    /// Peer going away (1001)
    GoingAway,
    /// Stream error or EOF without a close frame
    Abnormal(String),
    /// No inbound frame within one heartbeat interval
    HeartbeatTimeout,
    /// Handshake refused or policy close
    Rejected(String),
    /// Replaced by a newer `connect`
    Superseded,
}

impl CloseReason {
    /// Whether the owner should re-issue `connect`
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GoingAway | Self::Abnormal(_) | Self::HeartbeatTimeout
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal closure"),
            Self::GoingAway => write!(f, "peer going away"),
            Self::Abnormal(reason) => write!(f, "abnormal closure: {reason}"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Superseded => write!(f, "superseded by a new connection"),
        }
    }
}

/// One item of the inbound signaling sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(InboundMessage),
    /// A frame that failed to decode; the channel stays up
    DecodeError(ProtoError),
    /// Always the last item of a sequence
    Closed(CloseReason),
}

pub type SignalingEvents = BoxStream<'static, SignalingEvent>;

/// Persistent duplex connection to the relay's realtime endpoint
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a connection and return its inbound event sequence.
    ///
    /// A call while another connection is live supersedes and cancels it.
    async fn connect(&self, url: &str, token: &str) -> Result<SignalingEvents, SignalingError>;

    /// Queue a message; fails with `NotConnected` when no connection is live
    fn send(&self, message: OutboundMessage) -> Result<(), SignalingError>;

    async fn disconnect(&self);
}

/// Result of publishing local tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub remote_description: SessionDescription,
    pub tracks: Vec<TrackResult>,
    pub requires_immediate_renegotiation: bool,
}

/// Typed request/response access to the relay's session/track API
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn create_session(&self) -> Result<SessionId, RelayError>;

    async fn push_tracks(
        &self,
        session_id: &SessionId,
        offer: SessionDescription,
        tracks: Vec<TrackObject>,
    ) -> Result<PushResult, RelayError>;

    async fn pull_tracks(
        &self,
        session_id: &SessionId,
        tracks: Vec<TrackObject>,
    ) -> Result<TracksResponse, RelayError>;

    async fn renegotiate(
        &self,
        session_id: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    #[must_use]
    pub const fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

/// A transceiver of the local peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub direction: TransceiverDirection,
    /// Assigned once a local description has been applied
    pub mid: Option<String>,
    /// Id of the local track bound to the sender, if any
    pub track_id: Option<String>,
    pub kind: TrackKind,
}

/// The local WebRTC peer connection
///
/// Callers serialize description changes; implementations need not.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    async fn local_transceivers(&self) -> Result<Vec<TransceiverInfo>, NegotiationError>;

    /// Idempotent
    async fn close(&self);
}

/// Read-only access to stored credentials
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> crate::Result<Credentials>;
}
