//! Request/response and push-event channel to the signaling server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::endpoint::Direction;
use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::protocol::{
    ChatMessage, ConsumeParams, DtlsParameters, Incoming, PushEvent, Request, RtpCapabilities,
    RtpParameters, TransportOptions,
};

const OUTGOING_QUEUE: usize = 100;

/// Everything the signaling channel reports besides replies.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Push(PushEvent),
    /// The socket dropped; pending requests have failed.
    Disconnected,
    /// A fresh socket is up. Server-side state tied to the old one is gone.
    Reconnected,
}

/// A persistent bidirectional channel to the signaling server.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sends `request` and waits for its acknowledgment payload.
    async fn request(&self, request: Request) -> Result<Value>;

    /// Sends `request` without waiting for any acknowledgment.
    async fn notify(&self, request: Request) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProducedId {
    Bare(String),
    Wrapped { id: String },
}

/// Typed, time-bounded operations over a [`SignalingChannel`].
#[derive(Clone)]
pub struct SignalingBridge {
    channel: Arc<dyn SignalingChannel>,
    timeout: Duration,
}

impl SignalingBridge {
    pub fn new(channel: Arc<dyn SignalingChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.channel.subscribe()
    }

    async fn call(&self, request: Request) -> Result<Value> {
        let event = request.event();
        match tokio::time::timeout(self.timeout, self.channel.request(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                event,
                timeout: self.timeout,
            }),
        }
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn router_capabilities(&self) -> Result<RtpCapabilities> {
        self.call_typed(Request::GetRtpCapabilities).await
    }

    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        self.call(Request::JoinRoom {
            room_id: room_id.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.call(Request::LeaveRoom {
            room_id: room_id.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        direction: Direction,
        kind: MediaKind,
    ) -> Result<TransportOptions> {
        let room_id = room_id.to_owned();
        let request = match direction {
            Direction::Send => Request::CreateProducerTransport { room_id, kind },
            Direction::Recv => Request::CreateConsumerTransport { room_id, kind },
        };
        self.call_typed(request).await
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        direction: Direction,
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room_id = room_id.to_owned();
        let request = match direction {
            Direction::Send => Request::ConnectProducerTransport {
                room_id,
                kind,
                dtls_parameters,
            },
            Direction::Recv => Request::ConnectConsumerTransport {
                room_id,
                kind,
                dtls_parameters,
            },
        };
        self.call(request).await.map(drop)
    }

    /// Asks the server to create a producer and returns the id it assigned.
    pub async fn start_producing(
        &self,
        room_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let produced: ProducedId = self
            .call_typed(Request::StartProducing {
                room_id: room_id.to_owned(),
                kind,
                rtp_parameters,
            })
            .await?;
        Ok(match produced {
            ProducedId::Bare(id) | ProducedId::Wrapped { id } => id,
        })
    }

    pub async fn start_consuming(
        &self,
        room_id: &str,
        producer_id: &str,
        client_rtp_capabilities: RtpCapabilities,
        kind: MediaKind,
    ) -> Result<ConsumeParams> {
        self.call_typed(Request::StartConsuming {
            room_id: room_id.to_owned(),
            producer_id: producer_id.to_owned(),
            client_rtp_capabilities,
            kind,
        })
        .await
    }

    pub async fn resume_consuming(&self, consumer_id: &str) -> Result<()> {
        self.call(Request::ResumeConsuming {
            consumer_id: consumer_id.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn toggle_producer_state(&self, room_id: &str, kind: MediaKind, paused: bool) -> Result<()> {
        self.channel
            .notify(Request::ToggleProducerState {
                room_id: room_id.to_owned(),
                kind,
                paused,
            })
            .await
    }

    pub async fn send_chat(&self, room_id: &str, message: ChatMessage) -> Result<()> {
        self.channel
            .notify(Request::SendChat {
                room_id: room_id.to_owned(),
                message,
            })
            .await
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReply = oneshot::Sender<std::result::Result<Value, String>>;

struct Shared {
    url: String,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    events: broadcast::Sender<SignalEvent>,
    monitor: ConnectionMonitor,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        match Incoming::parse(text) {
            Ok(Incoming::Reply(reply)) => {
                let id = reply.id;
                match self.pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply.into_result());
                    }
                    None => debug!(id, "reply for a request nobody is waiting on"),
                }
            }
            Ok(Incoming::Push(event)) => {
                let _ = self.events.send(SignalEvent::Push(event));
            }
            Err(e) => warn!("ignoring malformed signaling frame: {}", e),
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            warn!(count = pending.len(), "failing requests in flight on lost socket");
        }
        // Dropping the senders wakes every waiter with ChannelClosed.
        drop(pending);
    }

    async fn reconnect(&self) -> Option<WsStream> {
        loop {
            let attempt = self.monitor.record_attempt();
            if attempt > self.max_reconnect_attempts {
                error!("Max reconnection attempts reached");
                self.monitor.update_state(ConnectionState::Failed);
                return None;
            }

            sleep(self.reconnect_delay).await;
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    self.monitor.mark_connected();
                    info!(attempt, "signaling reconnected");
                    return Some(ws);
                }
                Err(e) => {
                    warn!(attempt, "Reconnection failed: {}", e);
                    self.monitor.set_error(e.to_string());
                }
            }
        }
    }
}

/// Removes an abandoned request from the pending table.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// [`SignalingChannel`] over a WebSocket carrying JSON frames.
pub struct WsSignaling {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<String>,
}

impl WsSignaling {
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let monitor = ConnectionMonitor::new();
        monitor.update_state(ConnectionState::Connecting);

        let ws = match connect_async(config.signaling_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                monitor.set_error(e.to_string());
                monitor.update_state(ConnectionState::Failed);
                return Err(e.into());
            }
        };
        monitor.mark_connected();
        info!(url = %config.signaling_url, "signaling connected");

        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let shared = Arc::new(Shared {
            url: config.signaling_url.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            events,
            monitor,
        });

        tokio::spawn(run(Arc::clone(&shared), ws, outgoing_rx));

        Ok(Self { shared, outgoing })
    }

    pub fn monitor(&self) -> ConnectionMonitor {
        self.shared.monitor.clone()
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        if !self.shared.monitor.current().state.is_usable() {
            return Err(Error::ChannelClosed);
        }
        self.outgoing.send(frame).await.map_err(|_| Error::ChannelClosed)
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    async fn request(&self, request: Request) -> Result<Value> {
        let event = request.event();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request.to_frame(Some(id))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!(id, event, "signaling request");
        self.send_frame(frame).await?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(Error::Rejected { event, reason }),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    async fn notify(&self, request: Request) -> Result<()> {
        debug!(event = request.event(), "signaling notification");
        let frame = request.to_frame(None)?;
        self.send_frame(frame).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.shared.events.subscribe()
    }
}

/// Owns the socket: writes queued frames, dispatches inbound ones and reconnects.
async fn run(shared: Arc<Shared>, mut ws: WsStream, mut outgoing: mpsc::Receiver<String>) {
    loop {
        let (mut write, mut read) = ws.split();

        let reason = loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            break e.to_string();
                        }
                    }
                    None => {
                        // Every handle is gone.
                        let _ = write.close().await;
                        shared.monitor.update_state(ConnectionState::Disconnected);
                        shared.fail_pending();
                        return;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => break "closed by server".to_owned(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                },
            }
        };

        warn!("signaling socket lost: {}", reason);
        shared.monitor.set_error(reason);
        shared.fail_pending();
        let _ = shared.events.send(SignalEvent::Disconnected);

        ws = match shared.reconnect().await {
            Some(ws) => ws,
            None => return,
        };
        let _ = shared.events.send(SignalEvent::Reconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProducerDescriptor;

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(8);
        Shared {
            url: "ws://127.0.0.1:1".into(),
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_millis(1),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            events,
            monitor: ConnectionMonitor::new(),
        }
    }

    #[tokio::test]
    async fn reply_resolves_matching_request() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(7, tx);

        shared.dispatch(r#"{"id":7,"ok":true,"data":"prod-1"}"#);

        assert_eq!(rx.await.unwrap(), Ok(Value::from("prod-1")));
        assert!(shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn push_is_broadcast() {
        let shared = shared();
        let mut events = shared.events.subscribe();

        shared.dispatch(
            r#"{"event":"new-producer","data":{"roomId":"R1","producer":{"producerId":"p1","kind":"video"}}}"#,
        );

        let expected = SignalEvent::Push(PushEvent::NewProducer {
            room_id: "R1".into(),
            producer: ProducerDescriptor {
                producer_id: "p1".into(),
                kind: MediaKind::Video,
                peer_id: None,
            },
        });
        assert_eq!(events.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn lost_socket_fails_pending() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(1, tx);

        shared.fail_pending();

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_policy() {
        let shared = shared();
        assert!(shared.reconnect().await.is_none());
        assert_eq!(shared.monitor.current().state, ConnectionState::Failed);
    }
}
