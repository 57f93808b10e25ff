//! Scripted in-memory collaborators for driving the coordinator end to end
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use relaycall_core::config::{Config, MembershipPolicy};
use relaycall_core::credentials::StaticCredentialStore;
use relaycall_core::error::{NegotiationError, RelayError, SignalingError};
use relaycall_core::models::{Credentials, SessionId};
use relaycall_core::traits::{
    MediaNegotiator, PushResult, RelayApi, SignalingEvent, SignalingEvents, SignalingTransport,
    TransceiverDirection, TransceiverInfo,
};
use relaycall_core::{CallEvent, CallHandle, CallSnapshot, CoordinatorDeps, SessionCoordinator};
use relaycall_proto::relay::{SdpType, SessionDescription, TrackObject, TrackResult, TracksResponse};
use relaycall_proto::{InboundMessage, OutboundMessage, TrackKind};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const LOCAL_SESSION: &str = "local-session";

/// Ordered record of relay and engine calls, shared by the fakes
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries from the first occurrence of `marker` onwards
    pub fn since(&self, marker: &str) -> Vec<String> {
        let entries = self.entries();
        let start = entries.iter().position(|e| e == marker).unwrap_or(entries.len());
        entries[start..].to_vec()
    }
}

/// Counts concurrent calls and remembers the peak
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    async fn around<T>(&self, latency: Duration, fut: impl std::future::Future<Output = T>) -> T {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let out = fut.await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        out
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

type ScriptedConnection = Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

#[derive(Default)]
pub struct FakeSignaling {
    connections: Mutex<VecDeque<ScriptedConnection>>,
    sent: Mutex<Vec<OutboundMessage>>,
    tokens: Mutex<Vec<String>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeSignaling {
    /// The next `connect` succeeds; events pushed into the sender are delivered
    pub fn script_connection(&self) -> mpsc::UnboundedSender<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().push_back(Ok(rx));
        tx
    }

    pub fn script_failure(&self, error: SignalingError) {
        self.connections.lock().unwrap().push_back(Err(error));
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for FakeSignaling {
    async fn connect(&self, _url: &str, token: &str) -> Result<SignalingEvents, SignalingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());

        let next = self.connections.lock().unwrap().pop_front();
        match next {
            Some(Ok(rx)) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(UnboundedReceiverStream::new(rx).boxed())
            }
            Some(Err(e)) => Err(e),
            None => Err(SignalingError::Connect("no scripted connection".to_string())),
        }
    }

    fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct FakeRelay {
    log: CallLog,
    latency: Mutex<Duration>,
    in_flight: InFlight,
    create_session: Mutex<VecDeque<Result<SessionId, RelayError>>>,
    push: Mutex<VecDeque<Result<PushResult, RelayError>>>,
    pull: Mutex<VecDeque<Result<TracksResponse, RelayError>>>,
    push_requests: Mutex<Vec<Vec<TrackObject>>>,
    pull_requests: Mutex<Vec<Vec<TrackObject>>>,
    renegotiations: Mutex<Vec<SessionDescription>>,
}

impl FakeRelay {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            latency: Mutex::new(Duration::ZERO),
            in_flight: InFlight::default(),
            create_session: Mutex::default(),
            push: Mutex::default(),
            pull: Mutex::default(),
            push_requests: Mutex::default(),
            pull_requests: Mutex::default(),
            renegotiations: Mutex::default(),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn script_create_session(&self, result: Result<SessionId, RelayError>) {
        self.create_session.lock().unwrap().push_back(result);
    }

    pub fn script_push(&self, result: Result<PushResult, RelayError>) {
        self.push.lock().unwrap().push_back(result);
    }

    pub fn script_pull(&self, result: Result<TracksResponse, RelayError>) {
        self.pull.lock().unwrap().push_back(result);
    }

    pub fn push_requests(&self) -> Vec<Vec<TrackObject>> {
        self.push_requests.lock().unwrap().clone()
    }

    pub fn pull_requests(&self) -> Vec<Vec<TrackObject>> {
        self.pull_requests.lock().unwrap().clone()
    }

    pub fn renegotiations(&self) -> Vec<SessionDescription> {
        self.renegotiations.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak()
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap()
    }
}

#[async_trait]
impl RelayApi for FakeRelay {
    async fn create_session(&self) -> Result<SessionId, RelayError> {
        self.in_flight
            .around(self.latency(), async {
                self.log.record("create_session");
                self.create_session
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(SessionId::new(LOCAL_SESSION)))
            })
            .await
    }

    async fn push_tracks(
        &self,
        _session_id: &SessionId,
        _offer: SessionDescription,
        tracks: Vec<TrackObject>,
    ) -> Result<PushResult, RelayError> {
        self.in_flight
            .around(self.latency(), async {
                self.log.record("push_tracks");
                self.push_requests.lock().unwrap().push(tracks.clone());
                let scripted = self.push.lock().unwrap().pop_front();
                scripted.unwrap_or_else(|| {
                    Ok(PushResult {
                        remote_description: SessionDescription::answer("relay-answer"),
                        tracks: tracks
                            .iter()
                            .map(|t| TrackResult {
                                mid: t.mid.clone(),
                                track_name: Some(t.track_name.clone()),
                                ..TrackResult::default()
                            })
                            .collect(),
                        requires_immediate_renegotiation: false,
                    })
                })
            })
            .await
    }

    async fn pull_tracks(
        &self,
        _session_id: &SessionId,
        tracks: Vec<TrackObject>,
    ) -> Result<TracksResponse, RelayError> {
        self.in_flight
            .around(self.latency(), async {
                self.log.record("pull_tracks");
                self.pull_requests.lock().unwrap().push(tracks.clone());
                let scripted = self.pull.lock().unwrap().pop_front();
                scripted.unwrap_or_else(|| {
                    Ok(TracksResponse {
                        requires_immediate_renegotiation: false,
                        tracks: tracks
                            .iter()
                            .enumerate()
                            .map(|(i, t)| TrackResult {
                                mid: Some(format!("r{i}")),
                                track_name: Some(t.track_name.clone()),
                                session_id: t.session_id.clone(),
                                ..TrackResult::default()
                            })
                            .collect(),
                        session_description: None,
                    })
                })
            })
            .await
    }

    async fn renegotiate(
        &self,
        _session_id: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), RelayError> {
        self.in_flight
            .around(self.latency(), async {
                self.log.record(format!("renegotiate:{}", sdp_kind(answer.kind)));
                self.renegotiations.lock().unwrap().push(answer);
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Media engine
// ---------------------------------------------------------------------------

pub struct FakeNegotiator {
    log: CallLog,
    latency: Mutex<Duration>,
    in_flight: InFlight,
    transceivers: Mutex<Vec<TransceiverInfo>>,
    reject_remote: Mutex<Option<NegotiationError>>,
    closed: AtomicBool,
}

impl FakeNegotiator {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            latency: Mutex::new(Duration::ZERO),
            in_flight: InFlight::default(),
            transceivers: Mutex::default(),
            reject_remote: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Add a sending transceiver; its mid is assigned by the next local description
    pub fn add_local_track(&self, track_id: &str, kind: TrackKind) {
        self.transceivers.lock().unwrap().push(TransceiverInfo {
            direction: TransceiverDirection::SendOnly,
            mid: None,
            track_id: Some(track_id.to_string()),
            kind,
        });
    }

    pub fn reject_next_remote(&self, error: NegotiationError) {
        *self.reject_remote.lock().unwrap() = Some(error);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Peak number of overlapping description calls
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak()
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap()
    }
}

#[async_trait]
impl MediaNegotiator for FakeNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log.record("create_offer");
        Ok(SessionDescription::offer("local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log.record("create_answer");
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.in_flight
            .around(self.latency(), async {
                self.log
                    .record(format!("set_local_description:{}", sdp_kind(desc.kind)));
                let mut transceivers = self.transceivers.lock().unwrap();
                for (i, t) in transceivers.iter_mut().enumerate() {
                    if t.mid.is_none() {
                        t.mid = Some(i.to_string());
                    }
                }
                Ok(())
            })
            .await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.in_flight
            .around(self.latency(), async {
                self.log
                    .record(format!("set_remote_description:{}", sdp_kind(desc.kind)));
                match self.reject_remote.lock().unwrap().take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
            .await
    }

    async fn local_transceivers(&self) -> Result<Vec<TransceiverInfo>, NegotiationError> {
        Ok(self.transceivers.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.log.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }
}

const fn sdp_kind(kind: SdpType) -> &'static str {
    match kind {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.signaling.url = "ws://relay.test/ws".to_string();
    config.credentials.api_key = "test-key".to_string();
    config.credentials.id = Some("me".to_string());
    config.reconnect.min_delay_ms = 10;
    config.reconnect.max_delay_ms = 100;
    config.reconnect.max_attempts = 3;
    config.reconnect.window_seconds = 5;
    config
}

pub fn prune_config() -> Config {
    let mut config = test_config();
    config.registry.membership = MembershipPolicy::Prune;
    config
}

pub struct Harness {
    pub log: CallLog,
    pub signaling: Arc<FakeSignaling>,
    pub relay: Arc<FakeRelay>,
    pub negotiator: Arc<FakeNegotiator>,
    /// Event feed of the first scripted connection
    pub feed: mpsc::UnboundedSender<SignalingEvent>,
    pub handle: CallHandle,
    pub events: broadcast::Receiver<CallEvent>,
    pub task: JoinHandle<CallSnapshot>,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(test_config(), |_, _, _| {})
    }

    /// Script the fakes before the coordinator starts
    pub fn start_with(
        config: Config,
        setup: impl FnOnce(&FakeSignaling, &FakeRelay, &FakeNegotiator),
    ) -> Self {
        let log = CallLog::default();
        let signaling = Arc::new(FakeSignaling::default());
        let relay = Arc::new(FakeRelay::new(log.clone()));
        let negotiator = Arc::new(FakeNegotiator::new(log.clone()));

        let feed = signaling.script_connection();
        setup(&signaling, &relay, &negotiator);

        let credentials = StaticCredentialStore::new(Credentials {
            api_key: config.credentials.api_key.clone(),
            id: config.credentials.id.clone(),
            name: None,
            email: None,
        });
        let deps = CoordinatorDeps {
            signaling: signaling.clone(),
            relay: relay.clone(),
            negotiator: negotiator.clone(),
            credentials: Arc::new(credentials),
        };

        let (coordinator, handle) = SessionCoordinator::new(&config, deps);
        let events = handle.subscribe();
        let task = coordinator.spawn();

        Self {
            log,
            signaling,
            relay,
            negotiator,
            feed,
            handle,
            events,
            task,
        }
    }

    pub fn deliver(&self, event: SignalingEvent) {
        self.feed.send(event).unwrap();
    }

    pub fn deliver_participants(&self, participants: Value) {
        self.deliver(user_state(participants));
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.handle.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("coordinator stopped before condition held");
        snapshot.clone()
    }

    /// Drain every event published so far
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll `condition` on the paused clock until it holds
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn user_state(participants: Value) -> SignalingEvent {
    let text = json!({
        "type": "userState",
        "state": {"call": {"participants": participants}}
    })
    .to_string();
    SignalingEvent::Message(InboundMessage::decode(&text).unwrap())
}

pub fn call_ended() -> SignalingEvent {
    SignalingEvent::Message(
        InboundMessage::decode(r#"{"type":"userState","state":{"call":null}}"#).unwrap(),
    )
}

pub fn host(id: &str, tracks: &[&str]) -> Value {
    json!({
        "id": id,
        "role": "host",
        "state": "joined",
        "tracks": tracks
            .iter()
            .map(|t| json!({"id": t, "type": "video", "state": "active"}))
            .collect::<Vec<_>>()
    })
}
