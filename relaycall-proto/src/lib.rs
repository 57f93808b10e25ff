//! RelayCall Protocol Definitions
//!
//! Wire schema shared by the signaling channel and the relay HTTP API.
//!
//! - [`signaling`]: JSON messages exchanged over the realtime socket, tagged by `type`
//! - [`relay`]: request/response bodies of the session/track HTTP API
//! - [`track_id`]: `"<relaySessionId>/<trackId>"` qualified identifiers

pub mod error;
pub mod relay;
pub mod signaling;
pub mod track_id;

pub use error::ProtoError;
pub use signaling::{
    InboundMessage, OutboundMessage, ParticipantRole, ParticipantState, TrackKind, TrackState,
};
pub use track_id::QualifiedTrackId;
