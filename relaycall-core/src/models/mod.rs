pub mod credentials;
pub mod id;
pub mod participant;
pub mod session;
pub mod track;

pub use credentials::Credentials;
pub use id::{ParticipantId, SessionId, TrackId};
pub use participant::Participant;
pub use session::Session;
pub use track::{InvalidTransition, PullState, PushState, Track};
