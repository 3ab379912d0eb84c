mod common;

use std::sync::Arc;

use common::{harness, harness_with};
use meet_client::protocol::Request;
use meet_client::{
    Error, MediaCapture, MediaConstraints, MediaKind, Producer, SessionConfig, SessionEvent,
    StaticSampleCapture, Transport, TransportState,
};

fn paused(h: &common::Harness, room: &str, kind: MediaKind) -> bool {
    h.manager
        .snapshot(room)
        .unwrap()
        .producers
        .get(kind)
        .as_ref()
        .unwrap()
        .paused
}

#[tokio::test]
async fn toggle_pauses_only_that_kind_in_that_room() {
    let h = harness();
    h.manager.join("R1").await.unwrap();
    h.manager.join("R2").await.unwrap();

    h.manager.toggle_state("R1", MediaKind::Audio, true).await.unwrap();

    assert!(paused(&h, "R1", MediaKind::Audio));
    assert!(!paused(&h, "R1", MediaKind::Video));
    assert!(!paused(&h, "R2", MediaKind::Audio));
    assert!(!paused(&h, "R2", MediaKind::Video));

    let toggles: Vec<Request> = h
        .router
        .requests()
        .into_iter()
        .filter(|r| matches!(r, Request::ToggleProducerState { .. }))
        .collect();
    assert_eq!(
        toggles,
        vec![Request::ToggleProducerState {
            room_id: "R1".into(),
            kind: MediaKind::Audio,
            paused: true,
        }]
    );

    h.manager.toggle_state("R1", MediaKind::Audio, false).await.unwrap();
    assert!(!paused(&h, "R1", MediaKind::Audio));
}

#[tokio::test]
async fn toggle_without_producer_fails() {
    let config = SessionConfig {
        produce_video: false,
        ..SessionConfig::default()
    };
    let h = harness_with(config, Arc::new(StaticSampleCapture::new("mic")));
    h.manager.join("R1").await.unwrap();

    let err = h
        .manager
        .toggle_state("R1", MediaKind::Video, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoProducer(MediaKind::Video)));
}

#[tokio::test]
async fn start_muted_publishes_paused() {
    let config = SessionConfig {
        start_audio_muted: true,
        ..SessionConfig::default()
    };
    let h = harness_with(config, Arc::new(StaticSampleCapture::new("local")));

    h.manager.join("R1").await.unwrap();

    assert!(paused(&h, "R1", MediaKind::Audio));
    assert!(!paused(&h, "R1", MediaKind::Video));
    assert_eq!(h.router.count_key("toggle-producer-state:audio"), 1);
}

#[tokio::test]
async fn rejected_connect_fails_only_that_transport() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.router.reject("connect-producer-transport:audio");

    let snapshot = h.manager.join("R1").await.unwrap();

    assert!(snapshot.producers.audio.is_none());
    assert!(snapshot.producers.video.is_some());
    assert_eq!(h.router.count_key("start-producing:audio"), 0);

    let send = h.endpoint.send_transports();
    let audio = send.iter().find(|t| t.id().starts_with("send-audio")).unwrap();
    let video = send.iter().find(|t| t.id().starts_with("send-video")).unwrap();
    assert!(audio.is_closed());
    assert_eq!(video.state(), TransportState::Connected);

    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::PublishFailed { kind, reason, .. } = event {
            failure = Some((kind, reason));
        }
    }
    let (kind, reason) = failure.unwrap();
    assert_eq!(kind, MediaKind::Audio);
    assert!(reason.contains("refused by router"));

    // The slot was cleared, so a replacement track can build a new transport.
    h.router.accept("connect-producer-transport:audio");
    let stream = StaticSampleCapture::new("local")
        .acquire(MediaConstraints { audio: true, video: false })
        .await
        .unwrap();
    let track = stream.track(MediaKind::Audio).unwrap().clone();
    h.manager.replace_track("R1", track).await.unwrap();
    assert!(h.manager.snapshot("R1").unwrap().producers.audio.is_some());
    assert_eq!(h.router.count("create-producer-transport"), 3);
}

#[tokio::test]
async fn refused_produce_aborts_that_kind() {
    let h = harness();
    h.router.reject("start-producing:video");

    let snapshot = h.manager.join("R1").await.unwrap();

    assert!(snapshot.producers.audio.is_some());
    assert!(snapshot.producers.video.is_none());
    let video = h
        .endpoint
        .send_transports()
        .into_iter()
        .find(|t| t.id().starts_with("send-video"))
        .unwrap();
    assert_eq!(video.aborted(), 1);
    assert!(video.producers().is_empty());
}

#[tokio::test]
async fn replace_track_swaps_without_new_producer() {
    let h = harness();
    let joined = h.manager.join("R1").await.unwrap();
    let old_track = joined
        .local_stream
        .unwrap()
        .track(MediaKind::Video)
        .unwrap()
        .clone();

    let fresh = StaticSampleCapture::new("screen")
        .acquire(MediaConstraints { audio: false, video: true })
        .await
        .unwrap();
    let new_track = fresh.track(MediaKind::Video).unwrap().clone();

    h.manager.replace_track("R1", new_track.clone()).await.unwrap();

    assert!(!old_track.is_live());
    assert!(new_track.is_live());
    assert_eq!(h.router.count("start-producing"), 2);

    let producers = h.endpoint.producers();
    let video = producers
        .iter()
        .find(|p| p.kind() == MediaKind::Video)
        .unwrap();
    assert_eq!(video.track_id(), new_track.id());

    let snapshot = h.manager.snapshot("R1").unwrap();
    assert_eq!(
        snapshot.local_stream.unwrap().track(MediaKind::Video).unwrap().id(),
        new_track.id()
    );
}

#[tokio::test]
async fn failed_replacement_keeps_old_track_for_teardown() {
    let h = harness();
    h.router.reject("start-producing:video");
    let joined = h.manager.join("R1").await.unwrap();
    let old_track = joined
        .local_stream
        .unwrap()
        .track(MediaKind::Video)
        .unwrap()
        .clone();

    let fresh = StaticSampleCapture::new("screen")
        .acquire(MediaConstraints { audio: false, video: true })
        .await
        .unwrap();
    let new_track = fresh.track(MediaKind::Video).unwrap().clone();

    let err = h
        .manager
        .replace_track("R1", new_track.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Publish { kind: MediaKind::Video, .. }));

    let snapshot = h.manager.snapshot("R1").unwrap();
    assert_eq!(
        snapshot.local_stream.unwrap().track(MediaKind::Video).unwrap().id(),
        old_track.id()
    );
    assert!(old_track.is_live());
    assert!(new_track.is_live());

    h.manager.leave("R1").await;
    assert!(!old_track.is_live());
}

#[tokio::test]
async fn unannounced_toggle_is_rolled_back() {
    let h = harness();
    h.manager.join("R1").await.unwrap();
    let mut events = h.manager.subscribe();
    h.router.reject("toggle-producer-state:audio");

    let err = h
        .manager
        .toggle_state("R1", MediaKind::Audio, true)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChannelClosed));
    assert!(!paused(&h, "R1", MediaKind::Audio));
    let audio = h
        .endpoint
        .producers()
        .into_iter()
        .find(|p| p.kind() == MediaKind::Audio)
        .unwrap();
    assert!(!audio.paused());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::ProducerStateChanged { .. }));
    }

    h.router.accept("toggle-producer-state:audio");
    h.manager.toggle_state("R1", MediaKind::Audio, true).await.unwrap();
    assert!(paused(&h, "R1", MediaKind::Audio));
}
