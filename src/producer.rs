use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::endpoint::Producer;
use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, MediaKind, PerKind};
use crate::room::RoomHandle;
use crate::session::{Context, SessionEvent};
use crate::transport::TransportLifecycle;

pub(crate) struct ProducerController<'a> {
    ctx: &'a Context,
    transports: TransportLifecycle<'a>,
}

impl<'a> ProducerController<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            transports: TransportLifecycle::new(ctx),
        }
    }

    /// Acquires local media and publishes one producer per available kind.
    pub(crate) async fn start_production(&self, room: &RoomHandle) -> Result<()> {
        let constraints = self.ctx.config.constraints();
        let stream = self
            .ctx
            .capture
            .acquire(constraints)
            .await
            .map_err(|e| Error::Production(e.to_string()))?;

        if stream.kinds().iter().all(|kind| !constraints.wants(*kind)) {
            stream.stop();
            return Err(Error::Production("no local track available".to_owned()));
        }
        if let Err(e) = room.with_open(|r| r.local_stream = Some(stream.clone())) {
            stream.stop();
            return Err(e);
        }
        info!(room_id = room.id(), kinds = ?stream.kinds(), "local media acquired");

        let config = &self.ctx.config;
        self.publish_stream(room, &stream, |kind| config.start_paused(kind))
            .await
    }

    /// Republishes the room's local stream on fresh transports after a reconnect.
    pub(crate) async fn resume_after_reconnect(&self, room: &RoomHandle, paused: PerKind<bool>) -> Result<()> {
        let stream = match room.with_open(|r| r.local_stream.clone())? {
            Some(stream) => stream,
            None => return Ok(()),
        };
        self.publish_stream(room, &stream, |kind| *paused.get(kind)).await
    }

    async fn publish_stream(
        &self,
        room: &RoomHandle,
        stream: &LocalStream,
        paused: impl Fn(MediaKind) -> bool,
    ) -> Result<()> {
        let constraints = self.ctx.config.constraints();
        let tracks: Vec<LocalTrack> = MediaKind::ALL
            .into_iter()
            .filter(|kind| constraints.wants(*kind))
            .filter_map(|kind| stream.track(kind).cloned())
            .collect();

        // Nothing is published until every producer transport exists.
        let created = join_all(
            tracks
                .iter()
                .map(|track| self.transports.create_producer_transport(room, track.kind())),
        )
        .await;
        for result in created {
            result?;
        }

        let published = join_all(tracks.into_iter().map(|track| {
            let kind = track.kind();
            let paused = paused(kind);
            async move { (kind, self.publish(room, track, paused).await) }
        }))
        .await;

        for (kind, result) in published {
            match result {
                Ok(_) => {}
                Err(Error::RoomClosed(id)) => return Err(Error::RoomClosed(id)),
                Err(e) => {
                    warn!(room_id = room.id(), %kind, "publish failed: {}", e);
                    self.ctx.emit(SessionEvent::PublishFailed {
                        room_id: room.id().to_owned(),
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Publishes `track` on the room's producer transport of its kind.
    ///
    /// The server assigns the producer id; the local producer only exists once it did.
    pub(crate) async fn publish(&self, room: &RoomHandle, track: LocalTrack, paused: bool) -> Result<Arc<dyn Producer>> {
        let kind = track.kind();
        let caps = self
            .ctx
            .capabilities
            .current()
            .ok_or(Error::CapabilitiesNotLoaded)?;
        if !caps.supports(kind) {
            return Err(Error::Publish {
                kind,
                reason: format!("no {} codec negotiated", kind),
            });
        }

        let handle = room
            .with_open(|r| r.producer_transports.get(kind).ready())?
            .ok_or_else(|| Error::InvalidState(format!("no {} producer transport", kind)))?;
        self.transports.connect_producer_transport(room, &handle).await?;

        let transport = handle.transport();
        let rtp_parameters = transport.begin_produce(&track).await?;
        let producer_id = match self
            .ctx
            .signaling
            .start_producing(room.id(), kind, rtp_parameters)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                transport.abort_produce(&track);
                return Err(Error::Publish {
                    kind,
                    reason: e.reason(),
                });
            }
        };
        let producer = transport.finish_produce(&producer_id, track, paused).await?;

        match room.with_open(|r| r.producers.get_mut(kind).replace(Arc::clone(&producer))) {
            Ok(Some(previous)) => previous.close(),
            Ok(None) => {}
            Err(e) => {
                producer.close();
                return Err(e);
            }
        }
        info!(room_id = room.id(), producer_id = %producer_id, %kind, paused, "producer published");

        if paused {
            if let Err(e) = self.ctx.signaling.toggle_producer_state(room.id(), kind, true).await {
                warn!(room_id = room.id(), %kind, "failed to announce paused producer: {}", e);
            }
        }
        Ok(producer)
    }

    /// Pauses or resumes one local producer and tells the server.
    pub(crate) async fn toggle_state(&self, room: &RoomHandle, kind: MediaKind, paused: bool) -> Result<()> {
        let producer = room
            .with_open(|r| r.producers.get(kind).clone())?
            .ok_or(Error::NoProducer(kind))?;

        let was_paused = producer.paused();
        if was_paused == paused {
            debug!(room_id = room.id(), %kind, paused, "producer already in requested state");
        } else {
            set_paused(producer.as_ref(), paused);
        }

        if let Err(e) = self
            .ctx
            .signaling
            .toggle_producer_state(room.id(), kind, paused)
            .await
        {
            // Remote peers never heard of it, so the local producer goes back.
            if was_paused != paused {
                set_paused(producer.as_ref(), was_paused);
            }
            warn!(room_id = room.id(), %kind, paused, "producer state change not announced: {}", e);
            return Err(e);
        }
        self.ctx.emit(SessionEvent::ProducerStateChanged {
            room_id: room.id().to_owned(),
            kind,
            paused,
        });
        Ok(())
    }

    /// Swaps the track behind the producer of the track's kind, publishing a new
    /// producer when there is none yet.
    pub(crate) async fn replace_track(&self, room: &RoomHandle, track: LocalTrack) -> Result<()> {
        let kind = track.kind();
        let track_id = track.id().to_owned();
        let producer = room.with_open(|r| r.producers.get(kind).clone())?;

        match producer {
            Some(producer) => producer.replace_track(track.clone()).await?,
            None => {
                debug!(room_id = room.id(), %kind, "no producer yet; publishing replacement track");
                self.transports.create_producer_transport(room, kind).await?;
                self.publish(room, track.clone(), self.ctx.config.start_paused(kind))
                    .await?;
            }
        }

        // The stream only takes the new track once it is on the wire, so a failed swap
        // leaves the old one in place for teardown.
        let installed = room.with_open(|r| {
            r.local_stream
                .get_or_insert_with(|| LocalStream::new(format!("{}-local", r.id)))
                .replace_track(track.clone())
        });
        let previous = match installed {
            Ok(previous) => previous,
            Err(e) => {
                track.stop();
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            if previous.id() != track_id {
                previous.stop();
            }
        }
        info!(room_id = room.id(), %kind, track_id = %track_id, "track replaced");
        Ok(())
    }
}

fn set_paused(producer: &dyn Producer, paused: bool) {
    if paused {
        producer.pause();
    } else {
        producer.resume();
    }
}
