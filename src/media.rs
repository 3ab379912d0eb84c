//! Media kinds and tracks.
//!
//! Local tracks are webrtc-rs sample tracks; capture devices (camera, microphone,
//! screen) live outside this crate and feed encoded samples into them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }
}

impl TryFrom<RTPCodecType> for MediaKind {
    type Error = RTPCodecType;

    fn try_from(codec_type: RTPCodecType) -> Result<Self, Self::Error> {
        match codec_type {
            RTPCodecType::Audio => Ok(MediaKind::Audio),
            RTPCodecType::Video => Ok(MediaKind::Video),
            other => Err(other),
        }
    }
}

/// One value per media kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerKind<T> {
    pub audio: T,
    pub video: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: MediaKind) -> &T {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> &mut T {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediaKind, &T)> {
        [(MediaKind::Audio, &self.audio), (MediaKind::Video, &self.video)].into_iter()
    }
}

/// A locally captured track backed by a webrtc-rs sample track.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    sample_track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, sample_track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: id.into(),
            kind,
            sample_track,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sample_track)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Ends the track. Samples written afterwards are dropped.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub async fn write_sample(&self, sample: &Sample) -> anyhow::Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.sample_track.write_sample(sample).await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// The local user's captured media, at most one track per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    pub id: String,
    tracks: PerKind<Option<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: PerKind::default(),
        }
    }

    pub fn with_track(mut self, track: LocalTrack) -> Self {
        self.replace_track(track);
        self
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.get(kind).as_ref()
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        self.tracks
            .iter()
            .filter_map(|(kind, track)| track.as_ref().map(|_| kind))
            .collect()
    }

    /// Installs `track` for its kind and hands back the track it displaced.
    pub fn replace_track(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        self.tracks.get_mut(track.kind()).replace(track)
    }

    pub fn stop(&self) {
        for (_, track) in self.tracks.iter() {
            if let Some(track) = track {
                track.stop();
            }
        }
    }
}

/// Handle to a track forwarded by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub producer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn any(&self) -> bool {
        self.audio || self.video
    }
}

/// Fallible provider of local tracks.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> anyhow::Result<LocalStream>;
}

/// Capture provider that hands out empty sample tracks for the application to feed.
pub struct StaticSampleCapture {
    stream_id: String,
    audio_codec: RTCRtpCodecCapability,
    video_codec: RTCRtpCodecCapability,
}

impl StaticSampleCapture {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio_codec: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            video_codec: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    pub fn with_codec(mut self, kind: MediaKind, codec: RTCRtpCodecCapability) -> Self {
        match kind {
            MediaKind::Audio => self.audio_codec = codec,
            MediaKind::Video => self.video_codec = codec,
        }
        self
    }

    fn codec(&self, kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => self.audio_codec.clone(),
            MediaKind::Video => self.video_codec.clone(),
        }
    }
}

#[async_trait]
impl MediaCapture for StaticSampleCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> anyhow::Result<LocalStream> {
        if !constraints.any() {
            return Err(anyhow::anyhow!("no media kind requested"));
        }

        let mut stream = LocalStream::new(self.stream_id.clone());
        for kind in MediaKind::ALL {
            if !constraints.wants(kind) {
                continue;
            }
            let track_id = format!("{}-{:08x}", kind, rand::random::<u32>());
            let sample_track = Arc::new(TrackLocalStaticSample::new(
                self.codec(kind),
                track_id.clone(),
                self.stream_id.clone(),
            ));
            stream.replace_track(LocalTrack::new(track_id, kind, sample_track));
        }
        Ok(stream)
    }
}
