use bgwp_node::{codec, GatewayMessage, NodeMessage, ProtoError};
use futures::prelude::*;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::Duration,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::{coordinator::CoordinatorHandle, ConnectionId};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Protocol Error")]
    Proto(#[from] ProtoError),
    #[error("No live connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Connection {0} closed")]
    Closed(ConnectionId),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Outbound half of the node transport: deliver a message to whichever
/// node currently sits behind `connection_id`
pub trait NodeChannel: Send + Sync {
    fn send(&self, connection_id: ConnectionId, message: GatewayMessage) -> Result<(), TransportError>;
}

/// Outbound queues of every live connection. Hands out connection ids,
/// which are never reused within a process.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    outbound: RwLock<HashMap<ConnectionId, UnboundedSender<GatewayMessage>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self) -> Result<(ConnectionId, UnboundedReceiver<GatewayMessage>), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = unbounded_channel();
        self.outbound
            .write()
            .map_err(|_| TransportError::LockPoisoned)?
            .insert(id, sender);
        Ok((id, receiver))
    }

    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        self.outbound
            .write()
            .map(|mut outbound| outbound.remove(&connection_id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.outbound.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeChannel for ConnectionTable {
    fn send(&self, connection_id: ConnectionId, message: GatewayMessage) -> Result<(), TransportError> {
        let outbound = self.outbound.read().map_err(|_| TransportError::LockPoisoned)?;
        let sender = outbound
            .get(&connection_id)
            .ok_or(TransportError::UnknownConnection(connection_id))?;
        sender
            .send(message)
            .map_err(|_| TransportError::Closed(connection_id))
    }
}

/// Accepts reader nodes over TCP. Each connection gets a reader loop that
/// feeds decoded messages to the coordinator and a writer task draining
/// the connection's outbound queue.
pub struct NodeListener {
    listener: TcpListener,
    table: Arc<ConnectionTable>,
    coordinator: CoordinatorHandle,
    idle_timeout: Duration,
}

impl NodeListener {
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<ConnectionTable>,
        coordinator: CoordinatorHandle,
        idle_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            log::error!("Unable to bind node listener to {addr:}");
            e
        })?;
        Ok(Self {
            listener,
            table,
            coordinator,
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        log::info!(
            "Accepting nodes on {:?}, idle timeout {:?}",
            self.listener.local_addr().ok(),
            self.idle_timeout
        );
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let table = self.table.clone();
                    let coordinator = self.coordinator.clone();
                    let idle_timeout = self.idle_timeout;
                    tokio::spawn(async move {
                        serve_connection(stream, peer, table, coordinator, idle_timeout).await
                    });
                }
                Err(e) => {
                    log::error!("Accept error {e:}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    table: Arc<ConnectionTable>,
    coordinator: CoordinatorHandle,
    idle_timeout: Duration,
) {
    let (connection_id, mut outbound) = match table.attach() {
        Ok(attached) => attached,
        Err(e) => {
            log::error!("Unable to attach connection from {peer:}: {e:}");
            return;
        }
    };
    log::info!("Connection {connection_id:} from {peer:}");

    let (read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = codec::write_frame(&mut write_half, &msg).await {
                log::error!("Write error on connection {connection_id:}: {e:}");
                break;
            }
        }
    });

    // lines are capped while buffering; the codec drops the rest of an
    // overlong line and the stream yields a single None right after the error
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(codec::MAX_FRAME_LEN));
    let mut overflowed = false;
    loop {
        let idle = tokio::time::sleep(idle_timeout);
        tokio::select! {
            _ = idle => {
                log::warn!("Connection {connection_id:} idle for {idle_timeout:?}, closing");
                break;
            }
            res = lines.next() => {
                match res {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match codec::decode::<NodeMessage>(&line) {
                            Ok(msg) => {
                                if coordinator.dispatch(connection_id, msg).is_err() {
                                    log::error!("Coordinator is gone, closing connection {connection_id:}");
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("Connection {connection_id:}: undecodable frame {e:}");
                                table
                                    .send(
                                        connection_id,
                                        GatewayMessage::error("malformed message", format!("{e:}")),
                                    )
                                    .ok();
                            }
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        log::warn!("Connection {connection_id:}: frame over {} bytes", codec::MAX_FRAME_LEN);
                        table
                            .send(connection_id, GatewayMessage::error("malformed message", "frame too long"))
                            .ok();
                        overflowed = true;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        log::error!("Socket error on connection {connection_id:}: {e:}");
                        break;
                    }
                    None if overflowed => {
                        overflowed = false;
                    }
                    None => {
                        log::info!("Connection {connection_id:} closed by {peer:}");
                        break;
                    }
                }
            }
        }
    }

    // dropping the outbound sender lets the writer finish
    table.detach(connection_id);
    coordinator.node_disconnected(connection_id).ok();
    writer.await.ok();
}
