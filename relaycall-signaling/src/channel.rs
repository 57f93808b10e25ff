//! Signaling channel
//!
//! One live WebSocket connection at a time. `connect` spawns a driver task that
//! owns the socket: it writes queued outbound frames, decodes inbound frames
//! into [`SignalingEvent`]s, sends the heartbeat ping and reports exactly one
//! [`SignalingEvent::Closed`] at the end. Reconnecting is the owner's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use relaycall_core::config::SignalingConfig;
use relaycall_core::error::SignalingError;
use relaycall_core::traits::{CloseReason, SignalingEvent, SignalingEvents, SignalingTransport};
use relaycall_proto::{InboundMessage, OutboundMessage};

use crate::close::{classify_close, classify_connect_error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    id: u64,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// WebSocket implementation of [`SignalingTransport`]
pub struct SignalingChannel {
    heartbeat_interval: Duration,
    send_queue_capacity: usize,
    event_queue_capacity: usize,
    connection: Arc<Mutex<Option<Connection>>>,
    next_id: AtomicU64,
}

impl SignalingChannel {
    #[must_use]
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            send_queue_capacity: config.send_queue_capacity.max(1),
            event_queue_capacity: config.event_queue_capacity.max(1),
            connection: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|conn| !conn.outbound.is_closed())
    }

    /// Cancel the live connection, if any; its stream ends with `Superseded`
    fn supersede(&self) {
        if let Some(old) = self.connection.lock().take() {
            debug!(connection = old.id, "Superseding signaling connection");
            old.cancel.cancel();
        }
    }
}

/// Append the token as a query parameter; only `ws`/`wss` endpoints are accepted
pub fn connection_url(url: &str, token: &str) -> Result<Url, SignalingError> {
    let mut parsed =
        Url::parse(url).map_err(|e| SignalingError::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(SignalingError::InvalidUrl(format!(
            "expected ws or wss scheme, got {}",
            parsed.scheme()
        )));
    }
    parsed.query_pairs_mut().append_pair("token", token);
    Ok(parsed)
}

#[async_trait]
impl SignalingTransport for SignalingChannel {
    async fn connect(&self, url: &str, token: &str) -> Result<SignalingEvents, SignalingError> {
        let endpoint = connection_url(url, token)?;
        self.supersede();

        debug!(host = endpoint.host_str().unwrap_or_default(), "Opening signaling connection");
        let (ws, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(classify_connect_error)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.send_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.event_queue_capacity);
        let cancel = CancellationToken::new();

        let driver = Driver {
            id,
            heartbeat_interval: self.heartbeat_interval,
            outbound: outbound_rx,
            events: events_tx,
            cancel: cancel.clone(),
            slot: Arc::clone(&self.connection),
        };
        let driver = tokio::spawn(driver.run(ws));

        // A connect that raced this one loses
        let previous = self.connection.lock().replace(Connection {
            id,
            outbound: outbound_tx,
            cancel,
            driver,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(connection = id, "Signaling connected");
        Ok(ReceiverStream::new(events_rx).boxed())
    }

    fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        let text = message.encode()?;
        let guard = self.connection.lock();
        let conn = guard.as_ref().ok_or(SignalingError::NotConnected)?;

        conn.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SignalingError::Send("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SignalingError::NotConnected,
        })
    }

    /// Flush queued frames, send a normal close and wait for the driver to stop
    async fn disconnect(&self) {
        let Some(conn) = self.connection.lock().take() else {
            return;
        };
        let Connection {
            id,
            outbound,
            cancel,
            mut driver,
        } = conn;

        // Closing the queue tells the driver to drain and close
        drop(outbound);

        let limit = self.heartbeat_interval.max(Duration::from_secs(1));
        if tokio::time::timeout(limit, &mut driver).await.is_err() {
            warn!(connection = id, "Signaling driver did not stop in time, cancelling");
            cancel.cancel();
            driver.abort();
        }
        info!(connection = id, "Signaling disconnected");
    }
}

struct Driver {
    id: u64,
    heartbeat_interval: Duration,
    outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<SignalingEvent>,
    cancel: CancellationToken,
    slot: Arc<Mutex<Option<Connection>>>,
}

impl Driver {
    async fn run(mut self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heard_since_tick = true;

        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    close_quietly(&mut sink, self.heartbeat_interval).await;
                    break Some(CloseReason::Superseded);
                }
                queued = self.outbound.recv() => match queued {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            break Some(CloseReason::Abnormal(e.to_string()));
                        }
                    }
                    None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(connection = self.id, error = %e, "Close frame not sent");
                        }
                        break Some(CloseReason::Normal);
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heard_since_tick = true;
                        let event = match InboundMessage::decode(&text) {
                            Ok(message) => SignalingEvent::Message(message),
                            Err(e) => {
                                warn!(connection = self.id, error = %e, "Undecodable signaling frame");
                                SignalingEvent::DecodeError(e)
                            }
                        };
                        if self.events.send(event).await.is_err() {
                            // Nobody is listening any more
                            close_quietly(&mut sink, self.heartbeat_interval).await;
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break Some(classify_close(frame.as_ref())),
                    Some(Ok(_)) => heard_since_tick = true,
                    Some(Err(e)) => break Some(CloseReason::Abnormal(e.to_string())),
                    None => break Some(CloseReason::Abnormal("stream ended without close frame".to_string())),
                },
                _ = heartbeat.tick() => {
                    if !heard_since_tick {
                        close_quietly(&mut sink, self.heartbeat_interval).await;
                        break Some(CloseReason::HeartbeatTimeout);
                    }
                    heard_since_tick = false;
                    match OutboundMessage::Ping.encode() {
                        Ok(ping) => {
                            if let Err(e) = sink.send(Message::Text(ping)).await {
                                break Some(CloseReason::Abnormal(e.to_string()));
                            }
                        }
                        Err(e) => warn!(connection = self.id, error = %e, "Failed to encode ping"),
                    }
                }
            }
        };

        self.release_slot();

        if let Some(reason) = reason {
            if reason.is_recoverable() {
                warn!(connection = self.id, reason = %reason, "Signaling connection lost");
            } else {
                info!(connection = self.id, reason = %reason, "Signaling connection closed");
            }
            let _ = self.events.send(SignalingEvent::Closed(reason)).await;
        }
    }

    /// Make `send` fail fast once this connection is gone
    fn release_slot(&self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|conn| conn.id == self.id) {
            *slot = None;
        }
    }
}

/// Best-effort close frame; the peer may already be unreachable
async fn close_quietly(sink: &mut SplitSink<WsStream, Message>, limit: Duration) {
    if let Ok(Err(e)) = tokio::time::timeout(limit, sink.close()).await {
        debug!(error = %e, "Closing signaling socket failed");
    }
}
