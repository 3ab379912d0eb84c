use std::time::Duration;

use anyhow::Error as AnyhowError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::endpoint::{Direction, EndpointError};
use crate::media::MediaKind;

#[derive(Debug, Error)]
pub enum Error {
    /// The local endpoint rejected the router's capability set.
    #[error("capability load failed: {0}")]
    CapabilityLoad(String),

    #[error("capabilities are not loaded")]
    CapabilitiesNotLoaded,

    /// Connect handshake refused by the server.
    #[error("{direction} transport negotiation failed for {kind}: {reason}")]
    TransportNegotiation {
        direction: Direction,
        kind: MediaKind,
        reason: String,
    },

    #[error("{direction} transport for {kind} is still being created")]
    TransportPending { direction: Direction, kind: MediaKind },

    /// Local media could not be acquired.
    #[error("production failed: {0}")]
    Production(String),

    /// The server refused to create a producer for one kind.
    #[error("publishing {kind} failed: {reason}")]
    Publish { kind: MediaKind, reason: String },

    #[error("no {0} producer")]
    NoProducer(MediaKind),

    #[error("consuming producer {producer_id} failed: {reason}")]
    Consumption { producer_id: String, reason: String },

    #[error("request {event} rejected: {reason}")]
    Rejected { event: &'static str, reason: String },

    #[error("request {event} timed out after {timeout:?}")]
    Timeout { event: &'static str, timeout: Duration },

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("room {0} is already joined")]
    RoomAlreadyJoined(String),

    #[error("room {0} was left")]
    RoomClosed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

impl Error {
    /// Process-wide failures that block every join until recovered.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CapabilityLoad(_) | Self::CapabilitiesNotLoaded => true,

            Self::TransportNegotiation { .. }
            | Self::TransportPending { .. }
            | Self::Production(_)
            | Self::Publish { .. }
            | Self::NoProducer(_)
            | Self::Consumption { .. }
            | Self::Rejected { .. }
            | Self::Timeout { .. }
            | Self::ChannelClosed
            | Self::RoomNotFound(_)
            | Self::RoomAlreadyJoined(_)
            | Self::RoomClosed(_)
            | Self::InvalidState(_)
            | Self::Endpoint(_)
            | Self::Ws(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other(_) => false,
        }
    }

    /// Human readable reason, without the variant prefix, for rejections and timeouts.
    pub(crate) fn reason(&self) -> String {
        match self {
            Self::Rejected { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
