//! WebSocket signaling channel for the relay's realtime endpoint

pub mod channel;
mod close;

pub use channel::SignalingChannel;
