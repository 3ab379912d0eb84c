use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::protocol::{ProducerDescriptor, RtpCapabilities};
use crate::room::{Attach, Forgotten, RemoteStream, RoomHandle};
use crate::session::{Context, SessionEvent};
use crate::transport::TransportLifecycle;

pub(crate) struct ConsumerController<'a> {
    ctx: &'a Context,
    transports: TransportLifecycle<'a>,
}

impl<'a> ConsumerController<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            transports: TransportLifecycle::new(ctx),
        }
    }

    /// Creates the receive transports. Each one feeds the producers that were waiting
    /// on it as soon as it exists.
    pub(crate) async fn start_consumption(&self, room: &RoomHandle) -> Result<()> {
        let created = join_all(MediaKind::ALL.into_iter().map(|kind| async move {
            let created = self.transports.create_consumer_transport(room, kind).await;
            if created.is_ok() {
                self.consume_feed(room).await;
            }
            created
        }))
        .await;

        for result in created {
            result?;
        }
        Ok(())
    }

    /// Consumes every known producer that is not consumed yet and whose receive
    /// transport exists. Returns how many producers were attempted.
    pub(crate) async fn consume_feed(&self, room: &RoomHandle) -> usize {
        let caps = match self.ctx.capabilities.current() {
            Some(caps) => caps,
            None => {
                debug!(room_id = room.id(), "capabilities not loaded; deferring consumption");
                return 0;
            }
        };

        let missing = room.with(|r| r.kinds_missing_transport());
        if !missing.is_empty() {
            join_all(missing.into_iter().map(|kind| self.rebuild_transport(room, kind))).await;
        }

        // Claiming marks the producers as consuming before any request goes out.
        let claimed = room.with(|r| r.claim_consumable());
        if claimed.is_empty() {
            return 0;
        }
        debug!(room_id = room.id(), count = claimed.len(), "consuming producers");

        let attempted = claimed.len();
        join_all(
            claimed
                .into_iter()
                .map(|descriptor| self.consume_one(room, descriptor, &caps)),
        )
        .await;
        attempted
    }

    async fn rebuild_transport(&self, room: &RoomHandle, kind: MediaKind) {
        info!(room_id = room.id(), %kind, "recreating discarded consumer transport");
        match self.transports.create_consumer_transport(room, kind).await {
            Ok(_) => {}
            Err(Error::TransportPending { .. }) => {
                debug!(room_id = room.id(), %kind, "consumer transport already being recreated");
            }
            Err(e) => warn!(room_id = room.id(), %kind, "recreating consumer transport failed: {}", e),
        }
    }

    async fn consume_one(&self, room: &RoomHandle, descriptor: ProducerDescriptor, caps: &RtpCapabilities) {
        let producer_id = descriptor.producer_id.clone();
        match self.try_consume(room, &descriptor, caps).await {
            Ok(Some(stream)) => {
                info!(room_id = room.id(), producer_id = %producer_id, kind = %stream.kind, "remote stream added");
                self.ctx.emit(SessionEvent::RemoteStreamAdded {
                    room_id: room.id().to_owned(),
                    stream,
                });
            }
            Ok(None) => {
                debug!(room_id = room.id(), producer_id = %producer_id, "consumer discarded");
            }
            Err(e) => {
                room.with(|r| r.release(&producer_id));
                warn!(room_id = room.id(), producer_id = %producer_id, "consume failed: {}", e);
                self.ctx.emit(SessionEvent::ConsumeFailed {
                    room_id: room.id().to_owned(),
                    producer_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn try_consume(
        &self,
        room: &RoomHandle,
        descriptor: &ProducerDescriptor,
        caps: &RtpCapabilities,
    ) -> Result<Option<RemoteStream>> {
        let producer_id = &descriptor.producer_id;
        let consumption_failed = |reason: String| Error::Consumption {
            producer_id: producer_id.clone(),
            reason,
        };

        let params = self
            .ctx
            .signaling
            .start_consuming(room.id(), producer_id, caps.clone(), descriptor.kind)
            .await
            .map_err(|e| consumption_failed(e.reason()))?;

        // Bind by the kind the server reports, never by position.
        let handle = room
            .with_open(|r| r.consumer_transports.get(params.kind).ready())?
            .ok_or_else(|| consumption_failed(format!("no {} consumer transport", params.kind)))?;
        self.transports.connect_consumer_transport(room, &handle).await?;

        let consumer = handle.transport().consume(&params).await?;
        let resumed = match self.ctx.signaling.resume_consuming(consumer.id()).await {
            Ok(()) => consumer.resume().await.map_err(Error::from),
            Err(e) => Err(consumption_failed(e.reason())),
        };
        if let Err(e) = resumed {
            consumer.close();
            return Err(e);
        }

        match room.with(|r| r.attach_consumer(Arc::clone(&consumer))) {
            Attach::Added(stream) => Ok(Some(stream)),
            Attach::Duplicate | Attach::Stale => {
                consumer.close();
                Ok(None)
            }
        }
    }

    /// Records announced producers. Returns how many were new.
    pub(crate) fn on_producers(&self, room: &RoomHandle, producers: Vec<ProducerDescriptor>) -> usize {
        room.with_open(|r| {
            producers
                .into_iter()
                .filter(|descriptor| r.learn_producer(descriptor.clone()))
                .count()
        })
        .unwrap_or(0)
    }

    pub(crate) fn on_producer_closed(&self, room: &RoomHandle, producer_id: &str) {
        let forgotten = room.with(|r| r.forget_producer(producer_id));
        if forgotten.consumers.is_empty() && forgotten.streams.is_empty() {
            debug!(room_id = room.id(), producer_id, "closed producer had no consumer");
        }
        self.discard(room, forgotten);
    }

    pub(crate) fn on_peer_left(&self, room: &RoomHandle, peer_id: &str) {
        let forgotten = room.with(|r| r.forget_peer(peer_id));
        self.discard(room, forgotten);
        self.ctx.emit(SessionEvent::PeerLeft {
            room_id: room.id().to_owned(),
            peer_id: peer_id.to_owned(),
        });
    }

    fn discard(&self, room: &RoomHandle, forgotten: Forgotten) {
        for consumer in forgotten.consumers {
            debug!(room_id = room.id(), consumer_id = consumer.id(), "closing consumer");
            consumer.close();
        }
        for stream in forgotten.streams {
            info!(room_id = room.id(), producer_id = %stream.producer_id, kind = %stream.kind, "remote stream removed");
            self.ctx.emit(SessionEvent::RemoteStreamRemoved {
                room_id: room.id().to_owned(),
                producer_id: stream.producer_id,
                kind: stream.kind,
            });
        }
    }
}

/// Runs a feed for `room` in the background.
pub(crate) fn schedule_feed(ctx: &Arc<Context>, room: Arc<RoomHandle>) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        ConsumerController::new(&ctx).consume_feed(&room).await;
    });
}
