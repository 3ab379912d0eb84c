//! Seams to the local WebRTC stack.
//!
//! The session layer never touches ICE, DTLS or RTP itself. It drives a
//! [`MediaEndpoint`] (the local device) and the transports, producers and consumers it
//! hands out. Every handshake with the server is run by the session layer as an
//! explicit request/response; the endpoint only supplies local parameters and is told
//! the outcome.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::protocol::{ConsumeParams, DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "New"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

/// The local media device.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Initializes the device against the router's capabilities and returns the
    /// negotiated local set.
    async fn load(&self, router: &RtpCapabilities) -> Result<RtpCapabilities, EndpointError>;

    fn create_send_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn SendTransport>, EndpointError>;

    fn create_recv_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn RecvTransport>, EndpointError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> TransportState;

    /// Starts the local connect step and yields the DTLS parameters the server needs.
    /// The transport stays in `Connecting` until [`Transport::finish_connect`].
    async fn begin_connect(&self) -> Result<DtlsParameters, EndpointError>;

    /// Completes (or fails) the local connect step with the server's verdict.
    fn finish_connect(&self, outcome: Result<(), String>);

    fn close(&self);
}

#[async_trait]
pub trait SendTransport: Transport {
    /// Starts producing `track` and yields the RTP parameters to announce.
    async fn begin_produce(&self, track: &LocalTrack) -> Result<RtpParameters, EndpointError>;

    /// Completes a production started with [`SendTransport::begin_produce`] once the
    /// server has assigned `producer_id`.
    async fn finish_produce(
        &self,
        producer_id: &str,
        track: LocalTrack,
        paused: bool,
    ) -> Result<Arc<dyn Producer>, EndpointError>;

    /// Abandons a production the server refused.
    fn abort_produce(&self, track: &LocalTrack);
}

#[async_trait]
pub trait RecvTransport: Transport {
    /// Creates a paused consumer for the server-side consumer described by `params`.
    async fn consume(&self, params: &ConsumeParams) -> Result<Arc<dyn Consumer>, EndpointError>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    /// Swaps the outgoing track without renegotiating the transport.
    async fn replace_track(&self, track: LocalTrack) -> Result<(), EndpointError>;

    fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> RemoteTrack;

    async fn resume(&self) -> Result<(), EndpointError>;

    fn close(&self);
}
