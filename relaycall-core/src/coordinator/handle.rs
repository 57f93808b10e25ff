use tokio::sync::{broadcast, mpsc, watch};

use crate::error::{Error, Result};

use super::events::{CallEvent, UserIntent};
use super::state::CallSnapshot;

/// Observer and intent access to a running call
///
/// Cheap to clone; holders never touch coordinator state directly.
#[derive(Clone)]
pub struct CallHandle {
    intents: mpsc::Sender<UserIntent>,
    snapshots: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub(super) const fn new(
        intents: mpsc::Sender<UserIntent>,
        snapshots: watch::Receiver<CallSnapshot>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            intents,
            snapshots,
            events,
        }
    }

    /// Queue an intent; fails once the call has ended
    pub async fn send(&self, intent: UserIntent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| Error::invalid_state("call has ended"))
    }

    pub async fn accept(&self) -> Result<()> {
        self.send(UserIntent::Accept).await
    }

    pub async fn decline(&self) -> Result<()> {
        self.send(UserIntent::Decline).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(UserIntent::Leave).await
    }

    pub async fn retry_failed_pulls(&self) -> Result<()> {
        self.send(UserIntent::RetryFailedPulls).await
    }

    pub async fn local_tracks_changed(&self) -> Result<()> {
        self.send(UserIntent::LocalTracksChanged).await
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Snapshot stream; `changed()` resolves on every publish
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}
