use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::endpoint::{Direction, EndpointError, MediaEndpoint, RecvTransport, SendTransport, Transport};
use crate::error::{Error, Result};
use crate::media::{MediaKind, PerKind};
use crate::protocol::TransportOptions;
use crate::room::{Reservation, Room, RoomHandle, TransportSlot};
use crate::session::Context;

/// A transport owned by a room, together with its connect handshake.
pub(crate) struct TransportHandle<T: ?Sized> {
    kind: MediaKind,
    direction: Direction,
    connected: OnceCell<()>,
    transport: Arc<T>,
}

impl<T: Transport + ?Sized> TransportHandle<T> {
    pub(crate) fn new(kind: MediaKind, direction: Direction, transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            direction,
            connected: OnceCell::new(),
            transport,
        })
    }

    pub(crate) fn kind(&self) -> MediaKind {
        self.kind
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub(crate) fn close(&self) {
        debug!(transport_id = self.transport.id(), direction = %self.direction, kind = %self.kind, "closing transport");
        self.transport.close();
    }
}

trait TransportRole {
    type Object: Transport + ?Sized;

    const DIRECTION: Direction;

    fn slots(room: &mut Room) -> &mut PerKind<TransportSlot<Self::Object>>;

    fn build(endpoint: &dyn MediaEndpoint, options: &TransportOptions) -> std::result::Result<Arc<Self::Object>, EndpointError>;
}

struct SendRole;

impl TransportRole for SendRole {
    type Object = dyn SendTransport;

    const DIRECTION: Direction = Direction::Send;

    fn slots(room: &mut Room) -> &mut PerKind<TransportSlot<Self::Object>> {
        &mut room.producer_transports
    }

    fn build(endpoint: &dyn MediaEndpoint, options: &TransportOptions) -> std::result::Result<Arc<Self::Object>, EndpointError> {
        endpoint.create_send_transport(options)
    }
}

struct RecvRole;

impl TransportRole for RecvRole {
    type Object = dyn RecvTransport;

    const DIRECTION: Direction = Direction::Recv;

    fn slots(room: &mut Room) -> &mut PerKind<TransportSlot<Self::Object>> {
        &mut room.consumer_transports
    }

    fn build(endpoint: &dyn MediaEndpoint, options: &TransportOptions) -> std::result::Result<Arc<Self::Object>, EndpointError> {
        endpoint.create_recv_transport(options)
    }
}

/// Creates and connects transports for one session.
pub(crate) struct TransportLifecycle<'a> {
    ctx: &'a Context,
}

impl<'a> TransportLifecycle<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    pub(crate) async fn create_producer_transport(
        &self,
        room: &RoomHandle,
        kind: MediaKind,
    ) -> Result<Arc<TransportHandle<dyn SendTransport>>> {
        self.create::<SendRole>(room, kind).await
    }

    pub(crate) async fn create_consumer_transport(
        &self,
        room: &RoomHandle,
        kind: MediaKind,
    ) -> Result<Arc<TransportHandle<dyn RecvTransport>>> {
        self.create::<RecvRole>(room, kind).await
    }

    /// Runs the connect handshake of a producer transport unless it already ran.
    pub(crate) async fn connect_producer_transport(
        &self,
        room: &RoomHandle,
        handle: &Arc<TransportHandle<dyn SendTransport>>,
    ) -> Result<()> {
        self.ensure_connected::<SendRole>(room, handle).await
    }

    pub(crate) async fn connect_consumer_transport(
        &self,
        room: &RoomHandle,
        handle: &Arc<TransportHandle<dyn RecvTransport>>,
    ) -> Result<()> {
        self.ensure_connected::<RecvRole>(room, handle).await
    }

    async fn create<R: TransportRole>(
        &self,
        room: &RoomHandle,
        kind: MediaKind,
    ) -> Result<Arc<TransportHandle<R::Object>>> {
        if !self.ctx.capabilities.is_loaded() {
            return Err(Error::CapabilitiesNotLoaded);
        }

        match room.with_open(|r| R::slots(r).get_mut(kind).reserve())? {
            Reservation::Ready(handle) => {
                debug!(room_id = room.id(), direction = %R::DIRECTION, %kind, "transport already exists");
                return Ok(handle);
            }
            Reservation::Pending => {
                return Err(Error::TransportPending {
                    direction: R::DIRECTION,
                    kind,
                })
            }
            Reservation::Reserved => {}
        }

        let transport = match self.build::<R>(room.id(), kind).await {
            Ok(transport) => transport,
            Err(e) => {
                room.with(|r| R::slots(r).get_mut(kind).abandon());
                warn!(room_id = room.id(), direction = %R::DIRECTION, %kind, "transport creation failed: {}", e);
                return Err(e);
            }
        };

        let handle = TransportHandle::new(kind, R::DIRECTION, transport);
        if let Err(e) = room.with_open(|r| R::slots(r).get_mut(kind).fill(Arc::clone(&handle))) {
            handle.close();
            return Err(e);
        }

        info!(
            room_id = room.id(),
            transport_id = handle.transport().id(),
            direction = %R::DIRECTION,
            %kind,
            "transport created"
        );
        Ok(handle)
    }

    async fn build<R: TransportRole>(&self, room_id: &str, kind: MediaKind) -> Result<Arc<R::Object>> {
        let options = self
            .ctx
            .signaling
            .create_transport(room_id, R::DIRECTION, kind)
            .await?;
        Ok(R::build(self.ctx.endpoint.as_ref(), &options)?)
    }

    /// The local connect step only completes once the server acknowledged the DTLS
    /// parameters. Concurrent first users share one handshake.
    async fn ensure_connected<R: TransportRole>(
        &self,
        room: &RoomHandle,
        handle: &Arc<TransportHandle<R::Object>>,
    ) -> Result<()> {
        let kind = handle.kind;
        let outcome = handle
            .connected
            .get_or_try_init(|| self.handshake::<R>(room, handle))
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) => {
                if room.with(|r| R::slots(r).get_mut(kind).clear_if(handle)) {
                    warn!(room_id = room.id(), direction = %R::DIRECTION, %kind, "discarding transport: {}", e);
                    handle.close();
                }
                Err(e)
            }
        }
    }

    async fn handshake<R: TransportRole>(
        &self,
        room: &RoomHandle,
        handle: &Arc<TransportHandle<R::Object>>,
    ) -> Result<()> {
        let kind = handle.kind;
        let negotiation_failed = |reason: String| Error::TransportNegotiation {
            direction: R::DIRECTION,
            kind,
            reason,
        };

        if !room.with(|r| R::slots(r).get(kind).holds(handle)) {
            return Err(negotiation_failed("transport was discarded".to_owned()));
        }

        let transport = handle.transport();
        let dtls_parameters = transport
            .begin_connect()
            .await
            .map_err(|e| negotiation_failed(e.to_string()))?;

        match self
            .ctx
            .signaling
            .connect_transport(room.id(), R::DIRECTION, kind, dtls_parameters)
            .await
        {
            Ok(()) => {
                transport.finish_connect(Ok(()));
                info!(room_id = room.id(), transport_id = transport.id(), direction = %R::DIRECTION, %kind, "transport connected");
                Ok(())
            }
            Err(e) => {
                let reason = e.reason();
                transport.finish_connect(Err(reason.clone()));
                Err(negotiation_failed(reason))
            }
        }
    }
}
