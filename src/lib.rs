//! Client-side session and transport negotiation for SFU conferencing.
//!
//! A [`RoomSessionManager`] joins rooms on a router-backed signaling server, publishes
//! local audio and video as producers, and consumes the producers of remote peers.
//! The WebRTC primitives themselves are supplied through the [`endpoint`] traits.

pub mod capabilities;
pub mod config;
pub mod connection;
mod consumer;
pub mod endpoint;
pub mod error;
pub mod media;
mod producer;
pub mod protocol;
pub mod room;
pub mod session;
pub mod signaling;
mod transport;

pub use crate::config::SessionConfig;
pub use endpoint::{
    Consumer, Direction, EndpointError, MediaEndpoint, Producer, RecvTransport, SendTransport,
    Transport, TransportState,
};
pub use error::{Error, Result};
pub use media::{
    LocalStream, LocalTrack, MediaCapture, MediaConstraints, MediaKind, PerKind, RemoteTrack,
    StaticSampleCapture,
};
pub use room::{PeerInfo, ProducerInfo, RemoteStream, RoomPhase, RoomSnapshot, TransportInfo};
pub use session::{RoomSessionManager, SessionEvent};
pub use signaling::{SignalEvent, SignalingBridge, SignalingChannel, WsSignaling};
