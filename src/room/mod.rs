mod state;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::endpoint::{Direction, TransportState};
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaKind, PerKind, RemoteTrack};

pub(crate) use state::{Attach, Forgotten, Reservation, Room, Teardown, TransportSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoomPhase {
    Idle,
    Joining,
    Active,
    Leaving,
    Closed,
}

impl RoomPhase {
    /// Whether the room still accepts new resources.
    pub fn is_open(self) -> bool {
        matches!(self, RoomPhase::Idle | RoomPhase::Joining | RoomPhase::Active)
    }
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomPhase::Idle => write!(f, "Idle"),
            RoomPhase::Joining => write!(f, "Joining"),
            RoomPhase::Active => write!(f, "Active"),
            RoomPhase::Leaving => write!(f, "Leaving"),
            RoomPhase::Closed => write!(f, "Closed"),
        }
    }
}

/// A remote track grouped under the peer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer_key: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub track: RemoteTrack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub id: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub id: String,
    pub direction: Direction,
    pub kind: MediaKind,
    pub state: TransportState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub display_name: Option<String>,
}

/// What the UI layer gets to see of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub phase: RoomPhase,
    pub local_stream: Option<LocalStream>,
    pub remote_streams: Vec<RemoteStream>,
    pub producers: PerKind<Option<ProducerInfo>>,
    pub transports: Vec<TransportInfo>,
    pub consumer_count: usize,
    pub peers: Vec<PeerInfo>,
}

impl RoomSnapshot {
    pub fn has_stream(&self, producer_id: &str, kind: MediaKind) -> bool {
        self.remote_streams
            .iter()
            .any(|s| s.producer_id == producer_id && s.kind == kind)
    }
}

/// Shared handle to one joined room.
///
/// The lock is only ever taken between suspension points, which makes every
/// closure passed to [`RoomHandle::with`] atomic with respect to other flows on
/// the same room.
pub(crate) struct RoomHandle {
    id: String,
    state: Mutex<Room>,
}

impl RoomHandle {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            state: Mutex::new(Room::new(id)),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Room) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Like [`RoomHandle::with`] but fails once the room is being left.
    pub(crate) fn with_open<R>(&self, f: impl FnOnce(&mut Room) -> R) -> Result<R> {
        let mut room = self.state.lock();
        if !room.phase.is_open() {
            return Err(Error::RoomClosed(self.id.clone()));
        }
        Ok(f(&mut room))
    }

    pub(crate) fn phase(&self) -> RoomPhase {
        self.state.lock().phase
    }

    pub(crate) fn snapshot(&self) -> RoomSnapshot {
        self.state.lock().snapshot()
    }
}
