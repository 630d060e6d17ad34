use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc, mpsc::error::TrySendError},
};

use crate::error::DeliveryError;

pub type PeerId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle used to push frames at one connection. Cloned into the registry;
/// the socket itself stays with the connection's writer task.
#[derive(Clone, Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    outbox: mpsc::Sender<Bytes>,
    closed: Arc<Notify>,
}

/// Receiving end of a peer's outbox, drained by [`Outbox::run`].
pub struct Outbox {
    frames: mpsc::Receiver<Bytes>,
    closed: Arc<Notify>,
}

impl Peer {
    pub fn new(addr: SocketAddr, capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Arc::new(Notify::new());

        let peer = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            outbox: tx,
            closed: Arc::clone(&closed),
        };

        (peer, Outbox { frames: rx, closed })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues one encoded frame without waiting.
    pub fn send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        self.outbox.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Asks the owning connection handler to shut the connection down.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`Peer::close`] was called or the writer task stopped.
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}

impl Outbox {
    /// Writes queued frames to `writer` until every [`Peer`] handle is gone,
    /// then shuts the write side down. A failed write closes the peer.
    pub async fn run<W>(mut self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = self.frames.recv().await {
            if let Err(err) = writer.write_all(&frame).await {
                self.closed.notify_one();
                return Err(err);
            }
        }

        writer.shutdown().await
    }
}

#[cfg(test)]
impl Outbox {
    /// Decodes every frame queued so far.
    pub(crate) fn drain(&mut self) -> Vec<crate::protocol::ServerMessage> {
        std::iter::from_fn(|| self.frames.try_recv().ok())
            .map(|frame| serde_json::from_slice(&frame).expect("server frame"))
            .collect()
    }
}
