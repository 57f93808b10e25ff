//! RelayCall core
//!
//! Configuration, logging, errors and the call state machine: participant
//! registry, track synchronisation and the session coordinator. Signaling,
//! relay and media implementations plug in through [`traits`].

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod models;
pub mod registry;
pub mod resilience;
pub mod track_sync;
pub mod traits;

pub use config::Config;
pub use coordinator::{
    CallEvent, CallHandle, CallSnapshot, CallState, CoordinatorDeps, EndReason,
    SessionCoordinator, UserIntent,
};
pub use error::{Error, Result};
pub use registry::{ParticipantRegistry, RegistryDiff};
pub use track_sync::TrackSync;
