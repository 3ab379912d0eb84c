//! Signaling protocol messages.
//!
//! Every request the client can issue and every push the server can deliver is a
//! variant of a closed enum, so a new message kind has to be handled everywhere it is
//! matched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

/// Router or endpoint RTP capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Whether at least one codec of `kind` is available.
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }
}

/// Router-owned RTP parameters, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u64,
    #[serde(alias = "address")]
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Server-side transport parameters returned by `create-*-transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// A remote track announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(default, alias = "producerSocketId", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

impl ProducerDescriptor {
    /// Key used to group a peer's tracks into one stream.
    pub fn peer_key(&self) -> &str {
        self.peer_id.as_deref().unwrap_or(&self.producer_id)
    }
}

/// Reply to `start-consuming`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub text: String,
    pub ts: i64,
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Request {
    #[serde(rename = "getRtpCap")]
    GetRtpCapabilities,
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    CreateProducerTransport { room_id: String, kind: MediaKind },
    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        room_id: String,
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    StartProducing {
        room_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    CreateConsumerTransport { room_id: String, kind: MediaKind },
    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport {
        room_id: String,
        kind: MediaKind,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    StartConsuming {
        room_id: String,
        producer_id: String,
        client_rtp_capabilities: RtpCapabilities,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsuming { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ToggleProducerState {
        room_id: String,
        kind: MediaKind,
        paused: bool,
    },
    #[serde(rename = "chat-message", rename_all = "camelCase")]
    SendChat { room_id: String, message: ChatMessage },
}

impl Request {
    /// Wire name of the event.
    pub fn event(&self) -> &'static str {
        match self {
            Request::GetRtpCapabilities => "getRtpCap",
            Request::JoinRoom { .. } => "join-room",
            Request::LeaveRoom { .. } => "leave-room",
            Request::CreateProducerTransport { .. } => "create-producer-transport",
            Request::ConnectProducerTransport { .. } => "connect-producer-transport",
            Request::StartProducing { .. } => "start-producing",
            Request::CreateConsumerTransport { .. } => "create-consumer-transport",
            Request::ConnectConsumerTransport { .. } => "connect-consumer-transport",
            Request::StartConsuming { .. } => "start-consuming",
            Request::ResumeConsuming { .. } => "resume-consuming",
            Request::ToggleProducerState { .. } => "toggle-producer-state",
            Request::SendChat { .. } => "chat-message",
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            Request::CreateProducerTransport { kind, .. }
            | Request::ConnectProducerTransport { kind, .. }
            | Request::StartProducing { kind, .. }
            | Request::CreateConsumerTransport { kind, .. }
            | Request::ConnectConsumerTransport { kind, .. }
            | Request::StartConsuming { kind, .. }
            | Request::ToggleProducerState { kind, .. } => Some(*kind),
            Request::GetRtpCapabilities
            | Request::JoinRoom { .. }
            | Request::LeaveRoom { .. }
            | Request::ResumeConsuming { .. }
            | Request::SendChat { .. } => None,
        }
    }

    /// Fire-and-forget messages get no reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Request::ToggleProducerState { .. } | Request::SendChat { .. }
        )
    }

    /// Encodes the request as a wire frame, tagged with `id` when a reply is expected.
    pub fn to_frame(&self, id: Option<u64>) -> serde_json::Result<String> {
        let mut frame = serde_json::to_value(self)?;
        if let (Some(id), Value::Object(map)) = (id, &mut frame) {
            map.insert("id".to_owned(), Value::from(id));
        }
        serde_json::to_string(&frame)
    }
}

/// Server to client notifications.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    ExistingProducers {
        room_id: String,
        #[serde(default)]
        producers: Vec<ProducerDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        room_id: String,
        producer: ProducerDescriptor,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { room_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        room_id: String,
        peer_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: String, peer_id: String },
    #[serde(rename_all = "camelCase")]
    ChatMessage { room_id: String, message: ChatMessage },
}

impl PushEvent {
    pub fn room_id(&self) -> &str {
        match self {
            PushEvent::ExistingProducers { room_id, .. }
            | PushEvent::NewProducer { room_id, .. }
            | PushEvent::ProducerClosed { room_id, .. }
            | PushEvent::PeerJoined { room_id, .. }
            | PushEvent::PeerLeft { room_id, .. }
            | PushEvent::ChatMessage { room_id, .. } => room_id,
        }
    }
}

fn default_ok() -> bool {
    true
}

/// Server acknowledgment of a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Reply {
    /// Resolves the acknowledgment into its payload or the server's refusal reason.
    pub fn into_result(self) -> Result<Value, String> {
        if !self.ok {
            return Err(self.error.unwrap_or_else(|| "request refused".to_owned()));
        }
        match self.data {
            Value::String(ref s) if s == "error" => Err(self.error.unwrap_or_else(|| "error".to_owned())),
            data => Ok(data),
        }
    }
}

/// Any frame the server can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Reply(Reply),
    Push(PushEvent),
}

impl Incoming {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("id").is_some() {
            Ok(Incoming::Reply(serde_json::from_value(value)?))
        } else {
            Ok(Incoming::Push(serde_json::from_value(value)?))
        }
    }
}
