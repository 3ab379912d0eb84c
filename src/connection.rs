use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// State of the signaling socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Requests can only be sent in this state.
    pub fn is_usable(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Number of successful reconnects since the first connect.
    pub generation: u64,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            generation: 0,
            last_error: None,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn mark_connected(&self) {
        self.status.send_modify(|status| {
            if status.reconnect_attempts > 0 {
                status.generation += 1;
            }
            status.state = ConnectionState::Connected;
            status.reconnect_attempts = 0;
            status.last_error = None;
        });
    }

    pub fn record_attempt(&self) -> u32 {
        let mut attempts = 0;
        self.status.send_modify(|status| {
            status.reconnect_attempts += 1;
            status.state = ConnectionState::Reconnecting;
            attempts = status.reconnect_attempts;
        });
        attempts
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}
