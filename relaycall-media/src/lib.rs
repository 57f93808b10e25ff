//! Local WebRTC peer connection behind the `MediaNegotiator` seam

pub mod negotiator;

pub use negotiator::{RemoteTrack, WebRtcNegotiator};
