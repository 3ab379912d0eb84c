use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::{PeerInfo, ProducerInfo, RemoteStream, RoomPhase, RoomSnapshot, TransportInfo};
use crate::endpoint::{Consumer, Producer, RecvTransport, SendTransport, Transport};
use crate::media::{LocalStream, MediaKind, PerKind};
use crate::protocol::ProducerDescriptor;
use crate::transport::TransportHandle;

/// One per (room, direction, kind).
pub(crate) enum TransportSlot<T: ?Sized> {
    Empty,
    /// Creation is in flight; nobody else may create this transport.
    Creating,
    Ready(Arc<TransportHandle<T>>),
}

impl<T: ?Sized> Default for TransportSlot<T> {
    fn default() -> Self {
        TransportSlot::Empty
    }
}

pub(crate) enum Reservation<T: ?Sized> {
    Ready(Arc<TransportHandle<T>>),
    Pending,
    Reserved,
}

impl<T: ?Sized> TransportSlot<T> {
    /// Claims the right to create the transport unless it exists or is being created.
    pub(crate) fn reserve(&mut self) -> Reservation<T> {
        match self {
            TransportSlot::Ready(handle) => Reservation::Ready(Arc::clone(handle)),
            TransportSlot::Creating => Reservation::Pending,
            TransportSlot::Empty => {
                *self = TransportSlot::Creating;
                Reservation::Reserved
            }
        }
    }

    pub(crate) fn fill(&mut self, handle: Arc<TransportHandle<T>>) {
        *self = TransportSlot::Ready(handle);
    }

    /// Gives up a reservation after a failed creation.
    pub(crate) fn abandon(&mut self) {
        if matches!(self, TransportSlot::Creating) {
            *self = TransportSlot::Empty;
        }
    }

    pub(crate) fn ready(&self) -> Option<Arc<TransportHandle<T>>> {
        match self {
            TransportSlot::Ready(handle) => Some(Arc::clone(handle)),
            TransportSlot::Empty | TransportSlot::Creating => None,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self, TransportSlot::Ready(_))
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, TransportSlot::Empty)
    }

    pub(crate) fn holds(&self, handle: &Arc<TransportHandle<T>>) -> bool {
        match self {
            TransportSlot::Ready(current) => Arc::ptr_eq(current, handle),
            TransportSlot::Empty | TransportSlot::Creating => false,
        }
    }

    /// Empties the slot if it still holds `handle`.
    pub(crate) fn clear_if(&mut self, handle: &Arc<TransportHandle<T>>) -> bool {
        if self.holds(handle) {
            *self = TransportSlot::Empty;
            true
        } else {
            false
        }
    }

    pub(crate) fn take(&mut self) -> Option<Arc<TransportHandle<T>>> {
        match std::mem::take(self) {
            TransportSlot::Ready(handle) => Some(handle),
            TransportSlot::Empty | TransportSlot::Creating => None,
        }
    }
}

/// Outcome of binding a freshly created consumer to the room.
pub(crate) enum Attach {
    Added(RemoteStream),
    /// A consumer for this producer is already attached.
    Duplicate,
    /// The producer went away (or the room was left) while consuming.
    Stale,
}

/// Resources detached from a room, closed outside of its lock.
#[derive(Default)]
pub(crate) struct Teardown {
    pub(crate) producers: Vec<Arc<dyn Producer>>,
    pub(crate) consumers: Vec<Arc<dyn Consumer>>,
    pub(crate) send: Vec<Arc<TransportHandle<dyn SendTransport>>>,
    pub(crate) recv: Vec<Arc<TransportHandle<dyn RecvTransport>>>,
    pub(crate) local_stream: Option<LocalStream>,
}

impl Teardown {
    pub(crate) fn close(self) {
        for consumer in &self.consumers {
            consumer.close();
        }
        for producer in &self.producers {
            producer.close();
        }
        for handle in &self.recv {
            handle.close();
        }
        for handle in &self.send {
            handle.close();
        }
        if let Some(stream) = &self.local_stream {
            stream.stop();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.producers.is_empty()
            && self.consumers.is_empty()
            && self.send.is_empty()
            && self.recv.is_empty()
            && self.local_stream.is_none()
    }
}

/// Everything dropped when a remote producer goes away.
#[derive(Default)]
pub(crate) struct Forgotten {
    pub(crate) consumers: Vec<Arc<dyn Consumer>>,
    pub(crate) streams: Vec<RemoteStream>,
}

impl Forgotten {
    fn merge(&mut self, other: Forgotten) {
        self.consumers.extend(other.consumers);
        self.streams.extend(other.streams);
    }
}

pub(crate) struct Room {
    pub(crate) id: String,
    pub(crate) phase: RoomPhase,
    pub(crate) local_stream: Option<LocalStream>,
    pub(crate) producer_transports: PerKind<TransportSlot<dyn SendTransport>>,
    pub(crate) consumer_transports: PerKind<TransportSlot<dyn RecvTransport>>,
    pub(crate) producers: PerKind<Option<Arc<dyn Producer>>>,
    consumers: HashMap<String, Arc<dyn Consumer>>,
    known_producers: BTreeMap<String, ProducerDescriptor>,
    consuming: HashSet<String>,
    remote_streams: Vec<RemoteStream>,
    peers: BTreeMap<String, PeerInfo>,
}

impl Room {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            phase: RoomPhase::Idle,
            local_stream: None,
            producer_transports: PerKind::default(),
            consumer_transports: PerKind::default(),
            producers: PerKind::default(),
            consumers: HashMap::new(),
            known_producers: BTreeMap::new(),
            consuming: HashSet::new(),
            remote_streams: Vec::new(),
            peers: BTreeMap::new(),
        }
    }

    fn is_own_producer(&self, producer_id: &str) -> bool {
        self.producers
            .iter()
            .any(|(_, producer)| producer.as_ref().map_or(false, |p| p.id() == producer_id))
    }

    /// Records an announced producer. Returns false for repeats and for our own producers.
    pub(crate) fn learn_producer(&mut self, descriptor: ProducerDescriptor) -> bool {
        if self.is_own_producer(&descriptor.producer_id) {
            debug!(room_id = %self.id, producer_id = %descriptor.producer_id, "ignoring own producer");
            return false;
        }
        if self.known_producers.contains_key(&descriptor.producer_id) {
            return false;
        }
        self.known_producers
            .insert(descriptor.producer_id.clone(), descriptor);
        true
    }

    pub(crate) fn is_known(&self, producer_id: &str) -> bool {
        self.known_producers.contains_key(producer_id)
    }

    /// Marks every consumable producer as consuming and hands them back.
    ///
    /// Producers whose kind has no ready receive transport stay unclaimed until the
    /// transport exists.
    pub(crate) fn claim_consumable(&mut self) -> Vec<ProducerDescriptor> {
        if !self.phase.is_open() {
            return Vec::new();
        }
        let mut claimed = Vec::new();
        for (producer_id, descriptor) in &self.known_producers {
            if self.consuming.contains(producer_id) {
                continue;
            }
            if !self.consumer_transports.get(descriptor.kind).is_ready() {
                continue;
            }
            self.consuming.insert(producer_id.clone());
            claimed.push(descriptor.clone());
        }
        claimed
    }

    /// Kinds whose receive transport was discarded while producers of that kind still
    /// wait to be consumed. Only an active room rebuilds; joining creates its own.
    pub(crate) fn kinds_missing_transport(&self) -> Vec<MediaKind> {
        if self.phase != RoomPhase::Active {
            return Vec::new();
        }
        MediaKind::ALL
            .into_iter()
            .filter(|kind| self.consumer_transports.get(*kind).is_empty())
            .filter(|kind| {
                self.known_producers
                    .iter()
                    .any(|(id, descriptor)| descriptor.kind == *kind && !self.consuming.contains(id))
            })
            .collect()
    }

    pub(crate) fn is_consuming(&self, producer_id: &str) -> bool {
        self.consuming.contains(producer_id)
    }

    /// Releases a failed claim so a later feed can retry it.
    pub(crate) fn release(&mut self, producer_id: &str) {
        self.consuming.remove(producer_id);
    }

    pub(crate) fn attach_consumer(&mut self, consumer: Arc<dyn Consumer>) -> Attach {
        let producer_id = consumer.producer_id().to_owned();
        let descriptor = match self.known_producers.get(&producer_id) {
            Some(descriptor) if self.phase.is_open() => descriptor,
            _ => return Attach::Stale,
        };
        if self.consumers.values().any(|c| c.producer_id() == producer_id) {
            return Attach::Duplicate;
        }

        let kind = consumer.kind();
        let stream = RemoteStream {
            peer_key: descriptor.peer_key().to_owned(),
            producer_id: producer_id.clone(),
            kind,
            track: consumer.track(),
        };
        if !self
            .remote_streams
            .iter()
            .any(|s| s.producer_id == producer_id && s.kind == kind)
        {
            self.remote_streams.push(stream.clone());
        }
        self.consumers.insert(consumer.id().to_owned(), consumer);
        Attach::Added(stream)
    }

    pub(crate) fn forget_producer(&mut self, producer_id: &str) -> Forgotten {
        self.known_producers.remove(producer_id);
        self.consuming.remove(producer_id);

        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        let consumers = consumer_ids
            .iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect();

        let (streams, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.remote_streams)
            .into_iter()
            .partition(|s| s.producer_id == producer_id);
        self.remote_streams = kept;

        Forgotten { consumers, streams }
    }

    pub(crate) fn add_peer(&mut self, peer: PeerInfo) -> bool {
        self.peers.insert(peer.id.clone(), peer).is_none()
    }

    /// Drops the peer and every producer it owned.
    pub(crate) fn forget_peer(&mut self, peer_id: &str) -> Forgotten {
        self.peers.remove(peer_id);
        let owned: Vec<String> = self
            .known_producers
            .values()
            .filter(|d| d.peer_id.as_deref() == Some(peer_id))
            .map(|d| d.producer_id.clone())
            .collect();

        let mut forgotten = Forgotten::default();
        for producer_id in owned {
            forgotten.merge(self.forget_producer(&producer_id));
        }
        forgotten
    }

    /// Detaches every resource of the room.
    pub(crate) fn take_resources(&mut self) -> Teardown {
        let mut teardown = self.take_producer_side().0;
        teardown.consumers = self.consumers.drain().map(|(_, c)| c).collect();
        teardown.recv = MediaKind::ALL
            .into_iter()
            .filter_map(|kind| self.consumer_transports.get_mut(kind).take())
            .collect();
        teardown.local_stream = self.local_stream.take();

        self.known_producers.clear();
        self.consuming.clear();
        self.remote_streams.clear();
        self.peers.clear();
        teardown
    }

    /// Detaches producers and producer transports, keeping the local stream.
    /// Also reports which kinds were paused.
    pub(crate) fn take_producer_side(&mut self) -> (Teardown, PerKind<bool>) {
        let mut paused = PerKind::default();
        let mut teardown = Teardown::default();
        for kind in MediaKind::ALL {
            if let Some(producer) = self.producers.get_mut(kind).take() {
                *paused.get_mut(kind) = producer.paused();
                teardown.producers.push(producer);
            }
            if let Some(handle) = self.producer_transports.get_mut(kind).take() {
                teardown.send.push(handle);
            }
        }
        (teardown, paused)
    }

    pub(crate) fn snapshot(&self) -> RoomSnapshot {
        let mut transports = Vec::new();
        for (_, slot) in self.producer_transports.iter() {
            if let Some(handle) = slot.ready() {
                transports.push(transport_info(&handle));
            }
        }
        for (_, slot) in self.consumer_transports.iter() {
            if let Some(handle) = slot.ready() {
                transports.push(transport_info(&handle));
            }
        }

        RoomSnapshot {
            room_id: self.id.clone(),
            phase: self.phase,
            local_stream: self.local_stream.clone(),
            remote_streams: self.remote_streams.clone(),
            producers: PerKind {
                audio: producer_info(&self.producers.audio),
                video: producer_info(&self.producers.video),
            },
            transports,
            consumer_count: self.consumers.len(),
            peers: self.peers.values().cloned().collect(),
        }
    }
}

fn producer_info(producer: &Option<Arc<dyn Producer>>) -> Option<ProducerInfo> {
    producer.as_ref().map(|p| ProducerInfo {
        id: p.id().to_owned(),
        paused: p.paused(),
    })
}

fn transport_info<T: Transport + ?Sized>(handle: &TransportHandle<T>) -> TransportInfo {
    TransportInfo {
        id: handle.transport().id().to_owned(),
        direction: handle.direction(),
        kind: handle.kind(),
        state: handle.transport().state(),
    }
}
