//! Per-room sessions and the operations the UI layer drives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capabilities::CapabilityNegotiator;
use crate::config::SessionConfig;
use crate::consumer::{schedule_feed, ConsumerController};
use crate::endpoint::MediaEndpoint;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaCapture, MediaKind};
use crate::producer::ProducerController;
use crate::protocol::{ChatMessage, PushEvent};
use crate::room::{PeerInfo, RemoteStream, RoomHandle, RoomPhase, RoomSnapshot};
use crate::signaling::{SignalEvent, SignalingBridge, SignalingChannel};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomPhaseChanged { room_id: String, phase: RoomPhase },
    PeerJoined { room_id: String, peer: PeerInfo },
    PeerLeft { room_id: String, peer_id: String },
    RemoteStreamAdded { room_id: String, stream: RemoteStream },
    RemoteStreamRemoved {
        room_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    ProducerStateChanged {
        room_id: String,
        kind: MediaKind,
        paused: bool,
    },
    PublishFailed {
        room_id: String,
        kind: MediaKind,
        reason: String,
    },
    ConsumeFailed {
        room_id: String,
        producer_id: String,
        reason: String,
    },
    /// Re-establishing a room after a signaling reconnect failed.
    RecoveryFailed { room_id: String, reason: String },
    Chat { room_id: String, message: ChatMessage },
    SignalingLost,
    SignalingRestored,
}

/// State shared by every room of one session.
pub(crate) struct Context {
    pub(crate) config: SessionConfig,
    pub(crate) signaling: SignalingBridge,
    pub(crate) endpoint: Arc<dyn MediaEndpoint>,
    pub(crate) capture: Arc<dyn MediaCapture>,
    pub(crate) capabilities: CapabilityNegotiator,
    rooms: Mutex<HashMap<String, Arc<RoomHandle>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Context {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn room(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.lock().get(room_id).cloned()
    }

    fn open_rooms(&self) -> Vec<Arc<RoomHandle>> {
        self.rooms
            .lock()
            .values()
            .filter(|room| room.phase().is_open())
            .cloned()
            .collect()
    }

    /// Removes the entry only if it still belongs to `room`, not to a later join.
    fn remove_room(&self, room: &Arc<RoomHandle>) {
        let mut rooms = self.rooms.lock();
        if rooms.get(room.id()).map_or(false, |current| Arc::ptr_eq(current, room)) {
            rooms.remove(room.id());
        }
    }

    fn transition(&self, room: &RoomHandle, phase: RoomPhase) -> Result<()> {
        room.with_open(|r| r.phase = phase)?;
        self.announce_phase(room, phase);
        Ok(())
    }

    fn announce_phase(&self, room: &RoomHandle, phase: RoomPhase) {
        info!(room_id = room.id(), %phase, "room phase changed");
        self.emit(SessionEvent::RoomPhaseChanged {
            room_id: room.id().to_owned(),
            phase,
        });
    }

    /// Closes the room's resources and forgets it. Returns false if it was already closing.
    async fn shut_down(&self, room: &Arc<RoomHandle>) -> bool {
        let teardown = room.with(|r| {
            if !r.phase.is_open() {
                return None;
            }
            r.phase = RoomPhase::Leaving;
            Some(r.take_resources())
        });
        let teardown = match teardown {
            Some(teardown) => teardown,
            None => return false,
        };
        self.announce_phase(room, RoomPhase::Leaving);
        teardown.close();

        if let Err(e) = self.signaling.leave_room(room.id()).await {
            warn!(room_id = room.id(), "leave-room notification failed: {}", e);
        }

        room.with(|r| r.phase = RoomPhase::Closed);
        self.remove_room(room);
        self.announce_phase(room, RoomPhase::Closed);
        true
    }
}

/// Owns one session per joined room.
///
/// Must be created inside a Tokio runtime; it spawns the task that routes pushed
/// signaling events to rooms.
pub struct RoomSessionManager {
    ctx: Arc<Context>,
    pump: JoinHandle<()>,
}

impl RoomSessionManager {
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        endpoint: Arc<dyn MediaEndpoint>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        let signaling = SignalingBridge::new(channel, config.request_timeout());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let signals = signaling.subscribe();

        let ctx = Arc::new(Context {
            config,
            signaling,
            endpoint,
            capture,
            capabilities: CapabilityNegotiator::new(),
            rooms: Mutex::new(HashMap::new()),
            events,
        });
        let pump = tokio::spawn(route_signals(Arc::clone(&ctx), signals));

        Self { ctx, pump }
    }

    /// Joins `room_id`: announces it, loads capabilities, then publishes local media
    /// and prepares consumption concurrently.
    pub async fn join(&self, room_id: &str) -> Result<RoomSnapshot> {
        let room = {
            let mut rooms = self.ctx.rooms.lock();
            if rooms.contains_key(room_id) {
                return Err(Error::RoomAlreadyJoined(room_id.to_owned()));
            }
            let room = RoomHandle::new(room_id);
            rooms.insert(room_id.to_owned(), Arc::clone(&room));
            room
        };
        info!(room_id, "joining room");

        let joined = match self.ctx.transition(&room, RoomPhase::Joining) {
            Ok(()) => self.establish(&room).await,
            Err(e) => Err(e),
        };

        match joined.and_then(|()| self.ctx.transition(&room, RoomPhase::Active)) {
            Ok(()) => Ok(room.snapshot()),
            Err(e) => {
                if e.is_fatal() {
                    error!(room_id, "join failed: {}", e);
                } else {
                    warn!(room_id, "join failed: {}", e);
                }
                if !self.ctx.shut_down(&room).await {
                    self.ctx.remove_room(&room);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, room: &Arc<RoomHandle>) -> Result<()> {
        self.ctx.signaling.join_room(room.id()).await?;
        self.ctx
            .capabilities
            .load(&self.ctx.signaling, self.ctx.endpoint.as_ref())
            .await?;

        let producers = ProducerController::new(&self.ctx);
        let consumers = ConsumerController::new(&self.ctx);
        // Both sides run to completion so a failure never strands a half-created transport.
        let (produced, consumed) = tokio::join!(
            producers.start_production(room),
            consumers.start_consumption(room)
        );
        produced?;
        consumed?;
        Ok(())
    }

    /// Leaves `room_id`, releasing everything created for it. Unknown or already left
    /// rooms are ignored.
    pub async fn leave(&self, room_id: &str) {
        match self.ctx.room(room_id) {
            Some(room) => {
                if self.ctx.shut_down(&room).await {
                    info!(room_id, "left room");
                }
            }
            None => debug!(room_id, "leave of unknown room ignored"),
        }
    }

    pub async fn toggle_state(&self, room_id: &str, kind: MediaKind, paused: bool) -> Result<()> {
        let room = self.require(room_id)?;
        ProducerController::new(&self.ctx)
            .toggle_state(&room, kind, paused)
            .await
    }

    pub async fn replace_track(&self, room_id: &str, track: LocalTrack) -> Result<()> {
        let room = self.require(room_id)?;
        ProducerController::new(&self.ctx)
            .replace_track(&room, track)
            .await
    }

    /// Retries consumption of every producer not consumed yet. Returns how many were
    /// attempted.
    pub async fn retry_consumption(&self, room_id: &str) -> Result<usize> {
        let room = self.require(room_id)?;
        Ok(ConsumerController::new(&self.ctx).consume_feed(&room).await)
    }

    pub async fn send_chat(&self, room_id: &str, text: &str) -> Result<ChatMessage> {
        let room = self.require(room_id)?;
        if !room.phase().is_open() {
            return Err(Error::RoomClosed(room_id.to_owned()));
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let message = ChatMessage {
            id: format!("msg-{:08x}", rand::random::<u32>()),
            from: self.ctx.config.display_name.clone(),
            text: text.to_owned(),
            ts,
        };
        self.ctx
            .signaling
            .send_chat(room_id, message.clone())
            .await?;
        Ok(message)
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.ctx.room(room_id).map(|room| room.snapshot())
    }

    pub fn rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ctx.rooms.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    pub fn capabilities_loaded(&self) -> bool {
        self.ctx.capabilities.is_loaded()
    }

    /// Leaves every room.
    pub async fn close(&self) {
        for room_id in self.rooms() {
            self.leave(&room_id).await;
        }
    }

    fn require(&self, room_id: &str) -> Result<Arc<RoomHandle>> {
        self.ctx
            .room(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.to_owned()))
    }
}

impl Drop for RoomSessionManager {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Routes signaling events to the rooms they name.
async fn route_signals(ctx: Arc<Context>, mut signals: broadcast::Receiver<SignalEvent>) {
    loop {
        match signals.recv().await {
            Ok(SignalEvent::Push(event)) => handle_push(&ctx, event),
            Ok(SignalEvent::Disconnected) => {
                warn!("signaling lost");
                ctx.emit(SessionEvent::SignalingLost);
            }
            Ok(SignalEvent::Reconnected) => {
                ctx.capabilities.invalidate();
                ctx.emit(SessionEvent::SignalingRestored);
                for room in ctx.open_rooms() {
                    tokio::spawn(recover(Arc::clone(&ctx), room));
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "session fell behind signaling events");
            }
            Err(RecvError::Closed) => {
                info!("signaling event stream ended");
                break;
            }
        }
    }
}

fn handle_push(ctx: &Arc<Context>, event: PushEvent) {
    let room = match ctx.room(event.room_id()) {
        Some(room) => room,
        None => {
            debug!(room_id = event.room_id(), "push event for unknown room ignored");
            return;
        }
    };
    let consumers = ConsumerController::new(ctx);

    match event {
        PushEvent::ExistingProducers { producers, .. } => {
            let learned = consumers.on_producers(&room, producers);
            debug!(room_id = room.id(), learned, "existing producers");
            schedule_feed(ctx, room);
        }
        PushEvent::NewProducer { producer, .. } => {
            consumers.on_producers(&room, vec![producer]);
            schedule_feed(ctx, room);
        }
        PushEvent::ProducerClosed { producer_id, .. } => {
            consumers.on_producer_closed(&room, &producer_id);
        }
        PushEvent::PeerJoined {
            peer_id,
            display_name,
            ..
        } => {
            let peer = PeerInfo {
                id: peer_id,
                display_name,
            };
            if room.with_open(|r| r.add_peer(peer.clone())).unwrap_or(false) {
                ctx.emit(SessionEvent::PeerJoined {
                    room_id: room.id().to_owned(),
                    peer,
                });
            }
        }
        PushEvent::PeerLeft { peer_id, .. } => {
            consumers.on_peer_left(&room, &peer_id);
        }
        PushEvent::ChatMessage { message, .. } => {
            ctx.emit(SessionEvent::Chat {
                room_id: room.id().to_owned(),
                message,
            });
        }
    }
}

/// Re-establishes the producer side of a room on a fresh signaling connection.
async fn recover(ctx: Arc<Context>, room: Arc<RoomHandle>) {
    let (teardown, paused) = match room.with_open(|r| r.take_producer_side()) {
        Ok(detached) => detached,
        Err(_) => return,
    };
    teardown.close();
    info!(room_id = room.id(), "re-establishing room after reconnect");

    let recovered = async {
        ctx.signaling.join_room(room.id()).await?;
        ctx.capabilities
            .load(&ctx.signaling, ctx.endpoint.as_ref())
            .await?;
        ProducerController::new(&ctx)
            .resume_after_reconnect(&room, paused)
            .await
    }
    .await;

    match recovered {
        Ok(()) => schedule_feed(&ctx, room),
        Err(e) => {
            warn!(room_id = room.id(), "recovery failed: {}", e);
            ctx.emit(SessionEvent::RecoveryFailed {
                room_id: room.id().to_owned(),
                reason: e.to_string(),
            });
        }
    }
}
