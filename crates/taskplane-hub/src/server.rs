//! Hub-side TCP listener and per-unit connections.
//!
//! The hub listens for units; each accepted connection gets its own
//! framed transport and a read pump that forwards every complete frame
//! to whoever is waiting in [`UnitConnection::transact`]. Connect and
//! disconnect are broadcast to all current subscribers — events are not
//! replayed for late subscribers.
//!
//! `transact` holds the connection's async mutex for the whole
//! send-and-await-reply window, so a second transaction queues behind
//! the first instead of interleaving. Per connection, request order is
//! reply order.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use taskplane_core::cobs::CobsError;
use taskplane_core::wire::{self, HubToUnit, UnitToHub};
use taskplane_core::{CobsCodec, ErrorKind, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the connect/disconnect event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle events, broadcast to all subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A unit connected; look it up with [`HubServer::unit`].
    UnitConnected(u64),
    /// A unit disconnected and was removed from the registry.
    UnitDisconnected(u64),
}

struct ConnIo {
    writer: FramedWrite<OwnedWriteHalf, CobsCodec>,
    replies: mpsc::UnboundedReceiver<Bytes>,
}

/// One connected unit.
pub struct UnitConnection {
    id: u64,
    peer: SocketAddr,
    io: Mutex<ConnIo>,
}

impl UnitConnection {
    /// Registry id of this connection.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the unit.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request and await its reply.
    ///
    /// The connection mutex guards the full window, so at most one
    /// transaction is in flight per connection.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::EncodingFailed`] when the frame cannot be stuffed,
    /// [`ErrorKind::ReactorError`] on write failure or peer close while
    /// waiting, [`ErrorKind::DecodingFailed`] when the reply does not
    /// parse.
    pub async fn transact(&self, request: &HubToUnit) -> Result<UnitToHub> {
        let payload = wire::encode_message(request);
        let mut io = self.io.lock().await;

        debug!("unit {}: sending {}-byte request", self.id, payload.len());
        io.writer.send(Bytes::from(payload)).await.map_err(|err| {
            error!("unit {}: request write failed: {err}", self.id);
            match err {
                CobsError::Io(_) => ErrorKind::ReactorError,
                _ => ErrorKind::EncodingFailed,
            }
        })?;

        let Some(frame) = io.replies.recv().await else {
            error!("unit {}: connection closed while awaiting reply", self.id);
            return Err(ErrorKind::ReactorError);
        };
        wire::decode_reply(&frame)
    }
}

/// Listener plus the registry of connected units.
pub struct HubServer {
    listener: TcpListener,
    next_id: Cell<u64>,
    units: RefCell<BTreeMap<u64, Rc<UnitConnection>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl HubServer {
    /// Bind the listener on all interfaces.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure; startup treats it as fatal.
    pub async fn bind(port: u16) -> io::Result<Rc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("hub listening on port {}", listener.local_addr()?.port());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Rc::new(Self {
            listener,
            next_id: Cell::new(1),
            units: RefCell::new(BTreeMap::new()),
            events,
        }))
    }

    /// Port the listener is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket-name lookup failure.
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Subscribe to connection events from this moment on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Look up a connected unit by id.
    #[must_use]
    pub fn unit(&self, id: u64) -> Option<Rc<UnitConnection>> {
        self.units.borrow().get(&id).cloned()
    }

    /// Number of currently connected units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.borrow().len()
    }

    /// Accept connections until cancelled.
    ///
    /// Must run inside a `LocalSet`; each connection gets a local read
    /// pump task.
    pub async fn run(self: Rc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("accept loop stopping");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(err) => error!("accept failed: {err}"),
                },
            }
        }
    }

    fn admit(self: &Rc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        info!("unit {id} connected from {peer}");

        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let connection = Rc::new(UnitConnection {
            id,
            peer,
            io: Mutex::new(ConnIo {
                writer: FramedWrite::new(write_half, CobsCodec::new()),
                replies: reply_rx,
            }),
        });
        self.units.borrow_mut().insert(id, connection);

        let server = self.clone();
        tokio::task::spawn_local(async move {
            pump_replies(read_half, reply_tx).await;
            server.remove(id);
        });

        // Nobody listening is fine; events are not replayed anyway.
        let _ = self.events.send(ServerEvent::UnitConnected(id));
    }

    fn remove(&self, id: u64) {
        if self.units.borrow_mut().remove(&id).is_some() {
            info!("unit {id} disconnected");
            let _ = self.events.send(ServerEvent::UnitDisconnected(id));
        }
    }
}

/// Forward every decoded frame to the transaction waiter until the
/// connection ends.
async fn pump_replies(read_half: OwnedReadHalf, reply_tx: mpsc::UnboundedSender<Bytes>) {
    let mut reader = FramedRead::new(read_half, CobsCodec::new());
    loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                if reply_tx.send(frame).is_err() {
                    // Connection state already torn down.
                    return;
                }
            }
            Some(Err(err)) => {
                warn!("reply stream failed: {err}");
                return;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use taskplane_core::wire::{InitReq, InitResp, hub_to_unit, unit_to_hub};
    use tokio_util::codec::Framed;

    use super::*;

    async fn run_local<F: std::future::Future>(fut: F) -> F::Output {
        tokio::task::LocalSet::new().run_until(fut).await
    }

    /// Minimal in-process unit: answers one init request.
    async fn fake_unit(port: u16) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut framed = Framed::new(stream, CobsCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        let request = wire::decode_request(&frame).unwrap();
        assert!(matches!(request.sub, Some(hub_to_unit::Sub::Init(_))));

        let reply = UnitToHub {
            req_id: request.req_id,
            ts: Some(wire::Timestamp { sec: 1, nsec: 0 }),
            sub: Some(unit_to_hub::Sub::Init(InitResp {
                mac_addr: "DE:AD:BE:EF:00:01".into(),
                version: "0.0.0".into(),
            })),
        };
        framed
            .send(Bytes::from(wire::encode_message(&reply)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transact_roundtrips_through_a_unit() {
        run_local(async {
            let server = HubServer::bind(0).await.unwrap();
            let port = server.local_port().unwrap();
            let cancel = CancellationToken::new();
            tokio::task::spawn_local(server.clone().run(cancel.clone()));

            let mut events = server.subscribe();
            let unit_task = tokio::task::spawn_local(fake_unit(port));

            let Ok(ServerEvent::UnitConnected(id)) = events.recv().await else {
                panic!("expected a connect event");
            };
            let unit = server.unit(id).unwrap();

            let reply = unit
                .transact(&HubToUnit {
                    req_id: 1,
                    sub: Some(hub_to_unit::Sub::Init(InitReq {})),
                })
                .await
                .unwrap();
            assert_eq!(reply.req_id, 1);
            let Some(unit_to_hub::Sub::Init(init)) = reply.sub else {
                panic!("expected init reply");
            };
            assert_eq!(init.mac_addr, "DE:AD:BE:EF:00:01");

            unit_task.await.unwrap();
            let Ok(ServerEvent::UnitDisconnected(gone)) = events.recv().await else {
                panic!("expected a disconnect event");
            };
            assert_eq!(gone, id);
            assert_eq!(server.unit_count(), 0);

            cancel.cancel();
        })
        .await;
    }

    #[tokio::test]
    async fn transact_fails_cleanly_on_peer_close() {
        run_local(async {
            let server = HubServer::bind(0).await.unwrap();
            let port = server.local_port().unwrap();
            let cancel = CancellationToken::new();
            tokio::task::spawn_local(server.clone().run(cancel.clone()));

            let mut events = server.subscribe();
            let closer = tokio::task::spawn_local(async move {
                let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                drop(stream);
            });

            let Ok(ServerEvent::UnitConnected(id)) = events.recv().await else {
                panic!("expected a connect event");
            };
            closer.await.unwrap();
            let unit = server.unit(id);

            // Depending on timing the registry entry may already be
            // gone; when it is not, the transaction must fail with a
            // transport error instead of hanging.
            if let Some(unit) = unit {
                let result = unit
                    .transact(&HubToUnit {
                        req_id: 2,
                        sub: Some(hub_to_unit::Sub::Init(InitReq {})),
                    })
                    .await;
                assert_eq!(result.err(), Some(ErrorKind::ReactorError));
            }
            cancel.cancel();
        })
        .await;
    }
}
