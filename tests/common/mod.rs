// Shared fakes for the integration tests: an in-memory router speaking the signaling
// protocol and a WebRTC endpoint that only records what it is asked to do.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};

use meet_client::protocol::{
    ConsumeParams, DtlsParameters, ProducerDescriptor, PushEvent, Request, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportOptions,
};
use meet_client::{
    Consumer, EndpointError, Error, LocalStream, LocalTrack, MediaCapture, MediaConstraints,
    MediaEndpoint, MediaKind, Producer, RecvTransport, RemoteTrack, RoomSessionManager,
    SendTransport, SessionConfig, SignalEvent, SignalingChannel, StaticSampleCapture, Transport,
    TransportState,
};

pub fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".into(),
                clock_rate: 48000,
                channels: Some(2),
                preferred_payload_type: Some(100),
                parameters: Value::Null,
                rtcp_feedback: Vec::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".into(),
                clock_rate: 90000,
                channels: None,
                preferred_payload_type: Some(101),
                parameters: Value::Null,
                rtcp_feedback: Vec::new(),
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// In-memory signaling server.
///
/// Requests can be held back with [`FakeRouter::gate`] and refused with
/// [`FakeRouter::reject`]. Keys are `event:detail`, where the detail is the media kind,
/// the producer id for `start-consuming`, and empty otherwise.
pub struct FakeRouter {
    events: broadcast::Sender<SignalEvent>,
    log: Mutex<Vec<Request>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    rejected: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl FakeRouter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            log: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn key(request: &Request) -> String {
        let detail = match request {
            Request::StartConsuming { producer_id, .. } => producer_id.clone(),
            other => other.kind().map(|k| k.to_string()).unwrap_or_default(),
        };
        format!("{}:{}", request.event(), detail)
    }

    pub fn gate(&self, key: &str) {
        self.gates
            .lock()
            .insert(key.to_owned(), Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self, key: &str) {
        if let Some(gate) = self.gates.lock().remove(key) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn reject(&self, key: &str) {
        self.rejected.lock().insert(key.to_owned());
    }

    pub fn accept(&self, key: &str) {
        self.rejected.lock().remove(key);
    }

    pub fn push(&self, event: PushEvent) {
        let _ = self.events.send(SignalEvent::Push(event));
    }

    pub fn new_producer(&self, room_id: &str, producer_id: &str, kind: MediaKind, peer: Option<&str>) {
        self.push(PushEvent::NewProducer {
            room_id: room_id.into(),
            producer: descriptor(producer_id, kind, peer),
        });
    }

    /// Drops and restores the socket.
    pub fn bounce(&self) {
        let _ = self.events.send(SignalEvent::Disconnected);
        let _ = self.events.send(SignalEvent::Reconnected);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.log.lock().iter().filter(|r| r.event() == event).count()
    }

    pub fn count_key(&self, key: &str) -> usize {
        self.log.lock().iter().filter(|r| Self::key(r) == key).count()
    }

    fn reply(&self, request: &Request) -> Value {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        match request {
            Request::GetRtpCapabilities => json!(router_capabilities()),
            Request::CreateProducerTransport { kind, .. } => {
                transport_options(&format!("send-{}-{}", kind, n))
            }
            Request::CreateConsumerTransport { kind, .. } => {
                transport_options(&format!("recv-{}-{}", kind, n))
            }
            // Legacy servers answer with the bare id.
            Request::StartProducing { kind, .. } => json!(format!("prod-{}-{}", kind, n)),
            Request::StartConsuming {
                producer_id, kind, ..
            } => json!({
                "id": format!("cons-{}-{}", producer_id, n),
                "producerId": producer_id,
                "kind": kind,
                "rtpParameters": {},
            }),
            Request::JoinRoom { .. }
            | Request::LeaveRoom { .. }
            | Request::ConnectProducerTransport { .. }
            | Request::ConnectConsumerTransport { .. }
            | Request::ResumeConsuming { .. }
            | Request::ToggleProducerState { .. }
            | Request::SendChat { .. } => Value::Null,
        }
    }
}

#[async_trait]
impl SignalingChannel for FakeRouter {
    async fn request(&self, request: Request) -> meet_client::Result<Value> {
        let key = Self::key(&request);
        self.log.lock().push(request.clone());

        let gate = self.gates.lock().get(&key).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| Error::ChannelClosed)?;
        }

        if self.rejected.lock().contains(&key) {
            return Err(Error::Rejected {
                event: request.event(),
                reason: "refused by router".into(),
            });
        }
        Ok(self.reply(&request))
    }

    /// Notifications have no acknowledgment; a rejected one behaves like a lost socket.
    async fn notify(&self, request: Request) -> meet_client::Result<()> {
        let key = Self::key(&request);
        self.log.lock().push(request);
        if self.rejected.lock().contains(&key) {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }
}

pub fn descriptor(producer_id: &str, kind: MediaKind, peer: Option<&str>) -> ProducerDescriptor {
    ProducerDescriptor {
        producer_id: producer_id.into(),
        kind,
        peer_id: peer.map(Into::into),
    }
}

fn transport_options(id: &str) -> Value {
    json!({
        "id": id,
        "iceParameters": { "usernameFragment": "frag", "password": "secret" },
        "iceCandidates": [{
            "foundation": "udpcandidate",
            "priority": 1076302079u64,
            "ip": "10.0.0.1",
            "protocol": "udp",
            "port": 40000,
            "type": "host",
        }],
        "dtlsParameters": {
            "role": "auto",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }],
        },
    })
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    track: Mutex<LocalTrack>,
}

impl FakeProducer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn track_id(&self) -> String {
        self.track.lock().id().to_owned()
    }
}

#[async_trait]
impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<(), EndpointError> {
        *self.track.lock() = track;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    resumed: AtomicBool,
    closed: AtomicBool,
}

impl FakeConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> RemoteTrack {
        RemoteTrack {
            id: format!("track-{}", self.id),
            kind: self.kind,
            producer_id: self.producer_id.clone(),
        }
    }

    async fn resume(&self) -> Result<(), EndpointError> {
        self.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Serves as both send and receive transport.
pub struct FakeTransport {
    id: String,
    state: Mutex<TransportState>,
    connects: AtomicU64,
    aborted: AtomicU64,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            state: Mutex::new(TransportState::New),
            connects: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == TransportState::Closed
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn begin_connect(&self) -> Result<DtlsParameters, EndpointError> {
        let mut state = self.state.lock();
        if *state == TransportState::Closed {
            return Err(EndpointError::InvalidState("transport closed".into()));
        }
        *state = TransportState::Connecting;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(DtlsParameters {
            role: None,
            fingerprints: Vec::new(),
        })
    }

    fn finish_connect(&self, outcome: Result<(), String>) {
        *self.state.lock() = match outcome {
            Ok(()) => TransportState::Connected,
            Err(_) => TransportState::Failed,
        };
    }

    fn close(&self) {
        *self.state.lock() = TransportState::Closed;
    }
}

#[async_trait]
impl SendTransport for FakeTransport {
    async fn begin_produce(&self, track: &LocalTrack) -> Result<RtpParameters, EndpointError> {
        if self.state() != TransportState::Connected {
            return Err(EndpointError::InvalidState("produce on unconnected transport".into()));
        }
        Ok(RtpParameters(json!({ "mid": track.kind().as_str() })))
    }

    async fn finish_produce(
        &self,
        producer_id: &str,
        track: LocalTrack,
        paused: bool,
    ) -> Result<Arc<dyn Producer>, EndpointError> {
        let producer = Arc::new(FakeProducer {
            id: producer_id.to_owned(),
            kind: track.kind(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            track: Mutex::new(track),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    fn abort_produce(&self, _track: &LocalTrack) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecvTransport for FakeTransport {
    async fn consume(&self, params: &ConsumeParams) -> Result<Arc<dyn Consumer>, EndpointError> {
        if self.state() != TransportState::Connected {
            return Err(EndpointError::InvalidState("consume on unconnected transport".into()));
        }
        let consumer = Arc::new(FakeConsumer {
            id: params.id.clone(),
            producer_id: params.producer_id.clone(),
            kind: params.kind,
            resumed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }
}

#[derive(Default)]
pub struct FakeEndpoint {
    reject_load: AtomicBool,
    send: Mutex<Vec<Arc<FakeTransport>>>,
    recv: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_load(&self, reject: bool) {
        self.reject_load.store(reject, Ordering::SeqCst);
    }

    pub fn send_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.send.lock().clone()
    }

    pub fn recv_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.recv.lock().clone()
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        let mut all = self.send_transports();
        all.extend(self.recv_transports());
        all
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.send_transports()
            .iter()
            .flat_map(|t| t.producers())
            .collect()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.recv_transports()
            .iter()
            .flat_map(|t| t.consumers())
            .collect()
    }

    pub fn consumers_of(&self, producer_id: &str) -> Vec<Arc<FakeConsumer>> {
        self.consumers()
            .into_iter()
            .filter(|c| c.producer_id() == producer_id)
            .collect()
    }

    /// Whether every transport, producer and consumer ever handed out is closed.
    pub fn all_closed(&self) -> bool {
        self.transports().iter().all(|t| t.is_closed())
            && self.producers().iter().all(|p| p.is_closed())
            && self.consumers().iter().all(|c| c.is_closed())
    }
}

#[async_trait]
impl MediaEndpoint for FakeEndpoint {
    async fn load(&self, router: &RtpCapabilities) -> Result<RtpCapabilities, EndpointError> {
        if self.reject_load.load(Ordering::SeqCst) {
            return Err(EndpointError::Unsupported("no common codec".into()));
        }
        Ok(router.clone())
    }

    fn create_send_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn SendTransport>, EndpointError> {
        let transport = FakeTransport::new(&options.id);
        self.send.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn create_recv_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn RecvTransport>, EndpointError> {
        let transport = FakeTransport::new(&options.id);
        self.recv.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Capture that is always denied.
pub struct DeniedCapture;

#[async_trait]
impl MediaCapture for DeniedCapture {
    async fn acquire(&self, _constraints: MediaConstraints) -> anyhow::Result<LocalStream> {
        Err(anyhow::anyhow!("permission denied"))
    }
}

pub struct Harness {
    pub router: Arc<FakeRouter>,
    pub endpoint: Arc<FakeEndpoint>,
    pub manager: Arc<RoomSessionManager>,
}

pub fn harness() -> Harness {
    harness_with(SessionConfig::default(), Arc::new(StaticSampleCapture::new("local")))
}

pub fn harness_with(config: SessionConfig, capture: Arc<dyn MediaCapture>) -> Harness {
    let router = FakeRouter::new();
    let endpoint = FakeEndpoint::new();
    let manager = Arc::new(RoomSessionManager::new(
        config,
        router.clone(),
        endpoint.clone(),
        capture,
    ));
    Harness {
        router,
        endpoint,
        manager,
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Lets spawned tasks run without waiting on anything in particular.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
