use std::path::Path;
use std::time::Duration;

use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::{MediaConstraints, MediaKind};

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY_MS: u64 = 1000;
const EVENT_BUFFER: usize = 256;
const DEFAULT_DISPLAY_NAME: &str = "guest";
const ENV_PREFIX: &str = "MEET";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub signaling_url: String,
    /// Sender name on outgoing chat messages.
    pub display_name: String,
    /// Upper bound on every signaling round trip.
    pub request_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub produce_audio: bool,
    pub produce_video: bool,
    pub start_audio_muted: bool,
    pub start_video_muted: bool,
    /// Capacity of the push-event and session-event channels.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            display_name: DEFAULT_DISPLAY_NAME.to_owned(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            produce_audio: true,
            produce_video: true,
            start_audio_muted: false,
            start_video_muted: false,
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `MEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None, Environment::with_prefix(ENV_PREFIX))
    }

    /// A JSON file, with `MEET_*` environment variables taking precedence.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()), Environment::with_prefix(ENV_PREFIX))
    }

    fn load(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Json));
        }
        builder = builder.add_source(env.try_parsing(true));

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.produce_audio,
            video: self.produce_video,
        }
    }

    /// Whether the producer of `kind` starts out paused.
    pub fn start_paused(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.start_audio_muted,
            MediaKind::Video => self.start_video_muted,
        }
    }
}
