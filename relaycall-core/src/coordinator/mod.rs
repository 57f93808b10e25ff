//! Session coordinator
//!
//! One actor per call owns the registry, the track state machines and the
//! call state. It multiplexes four sources in a single `select!` loop:
//!
//! - user intents from [`CallHandle`]s
//! - the signaling event sequence
//! - the negotiation round in flight (at most one)
//! - the pending (re)connect
//!
//! Round and connect futures never touch actor state; their results are applied
//! by the loop when they resolve. Dropping a slot cancels the future in it.

mod events;
mod handle;
mod state;

pub use events::{CallEvent, UserIntent};
pub use handle::CallHandle;
pub use state::{CallSnapshot, CallState, EndReason};

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use relaycall_proto::{InboundMessage, OutboundMessage, ParticipantRole, ParticipantState};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result, SignalingError};
use crate::models::{Credentials, ParticipantId, Session, SessionId, Track};
use crate::registry::ParticipantRegistry;
use crate::resilience::reconnect::ReconnectPolicy;
use crate::resilience::timeout::with_timeout;
use crate::track_sync::{self, PullOutcome, PushOutcome, RoundTimeouts, TrackSync};
use crate::traits::{
    CloseReason, CredentialStore, MediaNegotiator, RelayApi, SignalingEvent, SignalingEvents,
    SignalingTransport,
};

const INTENT_QUEUE_CAPACITY: usize = 32;
const EVENT_BUS_CAPACITY: usize = 256;

/// External collaborators of one call
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub relay: Arc<dyn RelayApi>,
    pub negotiator: Arc<dyn MediaNegotiator>,
    pub credentials: Arc<dyn CredentialStore>,
}

enum RoundResult {
    SessionCreated(Result<SessionId>),
    Pushed(PushOutcome),
    Pulled(PullOutcome),
}

/// Coalesced triggers; repeated requests collapse into one round
#[derive(Debug, Default)]
struct PendingTriggers {
    create_session: bool,
    push: bool,
    pull: bool,
}

pub struct SessionCoordinator {
    signaling_url: String,
    reconnect_policy: ReconnectPolicy,
    timeouts: RoundTimeouts,

    signaling: Arc<dyn SignalingTransport>,
    relay: Arc<dyn RelayApi>,
    negotiator: Arc<dyn MediaNegotiator>,
    credential_store: Arc<dyn CredentialStore>,
    track_sync: TrackSync,

    registry: ParticipantRegistry,
    state: CallState,
    session: Option<Session>,
    credentials: Option<Credentials>,
    local_state: ParticipantState,
    published: Vec<Track>,
    session_requested: bool,
    push_done: bool,
    call_seen: bool,
    connected_once: bool,
    last_error: Option<Error>,
    end_reason: Option<EndReason>,

    events: Option<SignalingEvents>,
    round: Option<BoxFuture<'static, RoundResult>>,
    connecting: Option<BoxFuture<'static, Result<SignalingEvents>>>,
    pending: PendingTriggers,
    deferred: VecDeque<UserIntent>,

    intents: mpsc::Receiver<UserIntent>,
    snapshots: watch::Sender<CallSnapshot>,
    bus: broadcast::Sender<CallEvent>,
}

impl SessionCoordinator {
    pub fn new(config: &Config, deps: CoordinatorDeps) -> (Self, CallHandle) {
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_QUEUE_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let timeouts = RoundTimeouts::from_config(config);
        let track_sync = TrackSync::new(
            Arc::clone(&deps.relay),
            Arc::clone(&deps.negotiator),
            timeouts,
        );

        let handle = CallHandle::new(intent_tx, snapshot_rx, bus.clone());
        let coordinator = Self {
            signaling_url: config.signaling.url.clone(),
            reconnect_policy: ReconnectPolicy::from_config(&config.reconnect),
            timeouts,
            signaling: deps.signaling,
            relay: deps.relay,
            negotiator: deps.negotiator,
            credential_store: deps.credentials,
            track_sync,
            registry: ParticipantRegistry::new(config.registry.membership),
            state: CallState::Uninitialized,
            session: None,
            credentials: None,
            local_state: ParticipantState::None,
            published: Vec::new(),
            session_requested: false,
            push_done: false,
            call_seen: false,
            connected_once: false,
            last_error: None,
            end_reason: None,
            events: None,
            round: None,
            connecting: None,
            pending: PendingTriggers::default(),
            deferred: VecDeque::new(),
            intents: intent_rx,
            snapshots: snapshot_tx,
            bus,
        };

        (coordinator, handle)
    }

    /// Run the actor on the current runtime
    pub fn spawn(self) -> JoinHandle<CallSnapshot> {
        tokio::spawn(self.run())
    }

    /// Drive the call until it ends; returns the final snapshot
    pub async fn run(mut self) -> CallSnapshot {
        info!(url = %self.signaling_url, "Call coordinator started");

        match self.credential_store.load() {
            Ok(credentials) => self.credentials = Some(credentials),
            Err(e) => {
                self.end(EndReason::Failed(e)).await;
                return self.snapshot();
            }
        }
        self.start_connect();

        while !self.state.is_terminal() {
            self.drive();
            self.publish_snapshot();

            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent).await,
                    None => {
                        debug!("All call handles dropped, leaving");
                        self.handle_intent(UserIntent::Leave).await;
                    }
                },
                event = next_event(&mut self.events) => self.handle_signaling(event).await,
                result = poll_slot(&mut self.round) => {
                    self.round = None;
                    self.handle_round(result).await;
                }
                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    self.handle_connected(result).await;
                }
            }
        }

        info!(reason = ?self.end_reason, "Call coordinator stopped");
        self.snapshot()
    }

    /// Start the next round if none is in flight
    fn drive(&mut self) {
        if self.round.is_some() || self.state.is_terminal() {
            return;
        }

        let Some(session_id) = self.session.as_ref().map(|s| s.id.clone()) else {
            if std::mem::take(&mut self.pending.create_session) {
                self.start_create_session();
            }
            return;
        };

        if self.pending.push && self.local_state == ParticipantState::Joined {
            self.pending.push = false;
            let local = self.local_participant_id();
            let plan = TrackSync::begin_push(
                &mut self.registry,
                &session_id,
                local.as_ref(),
                &self.published,
            );
            let sync = self.track_sync.clone();
            debug!(session_id = %session_id, "Starting push round");
            self.round = Some(Box::pin(async move {
                RoundResult::Pushed(sync.execute_push(plan).await)
            }));
            return;
        }

        if self.pending.pull && self.push_done {
            self.pending.pull = false;
            match TrackSync::begin_pull(&mut self.registry, &session_id) {
                Some(plan) => {
                    let sync = self.track_sync.clone();
                    debug!(session_id = %session_id, tracks = plan.targets.len(), "Starting pull round");
                    self.round = Some(Box::pin(async move {
                        RoundResult::Pulled(sync.execute_pull(plan).await)
                    }));
                }
                None => {
                    if self.state == CallState::Negotiating {
                        self.transition(CallState::Active);
                    }
                }
            }
        }
    }

    fn start_create_session(&mut self) {
        let relay = Arc::clone(&self.relay);
        let limit = self.timeouts.relay;
        debug!("Creating relay session");
        self.round = Some(Box::pin(async move {
            RoundResult::SessionCreated(
                with_timeout(limit, "create_session", relay.create_session()).await,
            )
        }));
    }

    fn request_session(&mut self) {
        if self.session.is_none() && !self.session_requested {
            self.session_requested = true;
            self.pending.create_session = true;
        }
    }

    /// Connect through the bounded reconnect policy with the stored credentials
    fn start_connect(&mut self) {
        let Some(token) = self.credentials.as_ref().map(|c| c.api_key.clone()) else {
            return;
        };
        let signaling = Arc::clone(&self.signaling);
        let url = self.signaling_url.clone();
        let policy = self.reconnect_policy;

        self.connecting = Some(Box::pin(async move {
            policy
                .run("signaling connect", |attempt| {
                    let signaling = Arc::clone(&signaling);
                    let url = url.clone();
                    let token = token.clone();
                    async move {
                        debug!(attempt, "Connecting signaling");
                        signaling.connect(&url, &token).await.map_err(Error::from)
                    }
                })
                .await
        }));
    }

    async fn handle_intent(&mut self, intent: UserIntent) {
        debug!(?intent, state = %self.state, "User intent");

        match intent {
            UserIntent::Accept => match self.state {
                CallState::Uninitialized => {
                    self.deferred.push_back(intent);
                    self.request_session();
                }
                CallState::SessionCreated => self.accept(),
                CallState::Negotiating | CallState::Active => debug!("Already joined"),
                CallState::Ended => {}
            },
            UserIntent::Decline => {
                self.local_state = ParticipantState::Declined;
                self.send_update(&[]);
                self.end(EndReason::Declined).await;
            }
            UserIntent::Leave => {
                self.local_state = ParticipantState::None;
                self.send_update(&[]);
                self.end(EndReason::Left).await;
            }
            UserIntent::RetryFailedPulls => {
                let reset = TrackSync::reset_failed(&mut self.registry);
                info!(tracks = reset, "Retrying failed pulls");
                if reset > 0 {
                    self.pending.pull = true;
                }
            }
            UserIntent::LocalTracksChanged => {
                if self.local_state == ParticipantState::Joined {
                    self.pending.push = true;
                } else {
                    debug!("Local tracks changed before joining, nothing to push yet");
                }
            }
        }
    }

    fn accept(&mut self) {
        self.local_state = ParticipantState::Joined;
        if let Some(id) = self.local_participant_id() {
            if let Some(participant) = self.registry.participant_mut(&id) {
                participant.state = ParticipantState::Joined;
            }
        }
        self.transition(CallState::Negotiating);
        self.pending.push = true;
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(InboundMessage::UserState { state }) => match state.call {
                None => {
                    if self.call_seen || self.state != CallState::Uninitialized {
                        self.end(EndReason::Remote).await;
                    } else {
                        debug!("No call in progress yet");
                    }
                }
                Some(call) => {
                    self.call_seen = true;
                    let diff = self.registry.apply_update(&call.participants);

                    for rejected in &diff.rejected_tracks {
                        self.report_error(Error::Protocol(rejected.error.clone()));
                    }
                    if diff.has_changes() {
                        self.pending.pull = true;
                        self.publish(CallEvent::ParticipantsChanged {
                            inserted: diff.inserted,
                            updated: diff.updated,
                            removed: diff.removed.into_iter().map(|p| p.id).collect(),
                        });
                    }
                    self.request_session();
                }
            },
            SignalingEvent::Message(InboundMessage::Pong) => trace!("Heartbeat acknowledged"),
            SignalingEvent::Message(InboundMessage::Unknown) => {
                debug!("Dropping signaling message with unknown type");
            }
            SignalingEvent::DecodeError(e) => {
                self.report_error(Error::Protocol(e));
            }
            SignalingEvent::Closed(reason) => {
                self.events = None;
                let error = match &reason {
                    CloseReason::Rejected(msg) => {
                        Error::Signaling(SignalingError::Rejected(msg.clone()))
                    }
                    other => Error::Transport(format!("signaling closed: {other}")),
                };

                if reason.is_recoverable() {
                    warn!(reason = %reason, state = %self.state, "Signaling lost, reconnecting");
                    self.report_error(error);
                    self.start_connect();
                } else {
                    self.end(EndReason::Failed(error)).await;
                }
            }
        }
    }

    async fn handle_connected(&mut self, result: Result<SignalingEvents>) {
        match result {
            Ok(events) => {
                self.events = Some(events);
                let reconnected = std::mem::replace(&mut self.connected_once, true);
                info!(reconnected, "Signaling connected");

                self.send(OutboundMessage::ParticipantJoined);
                // Covers reconnects and updates dropped while not yet connected
                if self.push_done {
                    let published = self.published.clone();
                    self.send_update(&published);
                }
            }
            Err(e) => {
                error!(error = %e, "Signaling could not be (re)established");
                self.end(EndReason::Failed(e)).await;
            }
        }
    }

    async fn handle_round(&mut self, result: RoundResult) {
        match result {
            RoundResult::SessionCreated(Ok(id)) => {
                info!(session_id = %id, "Relay session created");
                self.session = Some(Session::new(id));
                self.transition(CallState::SessionCreated);

                while let Some(intent) = self.deferred.pop_front() {
                    self.handle_intent(intent).await;
                }
            }
            RoundResult::SessionCreated(Err(e)) => {
                self.end(EndReason::Failed(e)).await;
            }
            RoundResult::Pushed(outcome) => {
                match TrackSync::complete_push(&mut self.registry, outcome) {
                    Ok(report) => {
                        self.push_done = true;
                        for failed in report.failed {
                            self.publish(CallEvent::TrackFailed {
                                participant_id: failed.participant_id,
                                track_id: failed.track_id,
                                reason: failed.reason,
                            });
                        }
                        self.published = report.published;
                        let published = self.published.clone();
                        self.send_update(&published);
                        // The relay reveals pullable tracks only once we pushed
                        self.pending.pull = true;
                    }
                    Err(e) => self.end(EndReason::Failed(e)).await,
                }
            }
            RoundResult::Pulled(outcome) => {
                let report = TrackSync::complete_pull(&mut self.registry, outcome);

                for pulled in report.pulled {
                    self.publish(CallEvent::TrackPulled {
                        participant_id: pulled.participant_id,
                        track_id: pulled.track_id,
                        mid: pulled.mid,
                    });
                }
                for failed in report.failed {
                    self.publish(CallEvent::TrackFailed {
                        participant_id: failed.participant_id,
                        track_id: failed.track_id,
                        reason: failed.reason,
                    });
                }
                if let Some(e) = report.batch_error {
                    self.report_error(e);
                }

                if self.state == CallState::Negotiating {
                    self.transition(CallState::Active);
                }
            }
        }
    }

    /// Tear down everything this call owns. Idempotent.
    async fn end(&mut self, reason: EndReason) {
        if self.state.is_terminal() {
            return;
        }
        info!(reason = %reason, state = %self.state, "Ending call");

        self.round = None;
        self.connecting = None;
        self.deferred.clear();
        self.pending = PendingTriggers::default();

        self.negotiator.close().await;
        self.registry.clear();
        self.events = None;
        self.signaling.disconnect().await;
        self.session = None;
        self.published.clear();

        if let EndReason::Failed(e) = &reason {
            error!(error = %e, "Call failed");
            self.last_error = Some(e.clone());
        }
        self.end_reason = Some(reason.clone());
        self.transition(CallState::Ended);
        self.publish(CallEvent::Ended(reason));
        self.publish_snapshot();
    }

    fn transition(&mut self, to: CallState) {
        if !self.state.can_transition_to(to) {
            warn!(from = %self.state, to = %to, "Ignoring invalid state transition");
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        info!(from = %from, to = %to, "Call state changed");
        self.publish(CallEvent::StateChanged { from, to });
    }

    /// The local participant: configured id first, else the first `user`
    fn local_participant_id(&self) -> Option<ParticipantId> {
        if let Some(id) = self.credentials.as_ref().and_then(|c| c.id.as_deref()) {
            return Some(ParticipantId::new(id));
        }
        self.registry
            .participants_with_role(ParticipantRole::User)
            .next()
            .map(|p| p.id.clone())
    }

    fn send_update(&self, published: &[Track]) {
        let session_id = self.session.as_ref().map(|s| &s.id);
        self.send(track_sync::participant_update(
            self.local_state,
            session_id,
            published,
        ));
    }

    fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.signaling.send(message) {
            warn!(error = %e, "Failed to send signaling message");
        }
    }

    fn report_error(&mut self, error: Error) {
        warn!(error = %error, "Call error");
        self.last_error = Some(error.clone());
        self.publish(CallEvent::Error(error));
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.bus.send(event);
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            session: self.session.clone(),
            participants: self.registry.snapshot(),
            last_error: self.last_error.clone(),
            end_reason: self.end_reason.clone(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

async fn next_event(events: &mut Option<SignalingEvents>) -> SignalingEvent {
    match events {
        Some(stream) => stream.next().await.unwrap_or_else(|| {
            SignalingEvent::Closed(CloseReason::Abnormal("event stream ended".to_string()))
        }),
        None => std::future::pending().await,
    }
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
