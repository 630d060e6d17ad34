use anyhow::Result;
use std::{io, net::SocketAddr, time::Duration};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameBuffer};
use crate::limit::{RATE_WINDOW, RateLimiter};
use crate::peer::Peer;
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::router::Router;
use crate::state::ServerState;

// How long queued frames may take to reach the socket once the handler is done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A client that completed the join handshake. Dropping it removes the
/// registry entry (if this connection still owns it) and announces the
/// departure, whichever way the handler exits.
struct Session {
    router: Router,
    name: String,
    peer: Peer,
    limiter: Option<RateLimiter>,
}

impl Drop for Session {
    fn drop(&mut self) {
        let registry = self.router.registry();
        let removed = registry.unregister(&self.name, self.peer.id()).is_some();

        // Evicted earlier, and someone else has joined under the name since.
        if !removed && registry.lookup(&self.name).is_some() {
            info!(peer = %self.peer.addr(), name = %self.name, "client left, name already reused");
            return;
        }

        self.router
            .broadcast(&ServerMessage::system(format!("{} left", self.name)));
        self.router.push_online_list();

        info!(peer = %self.peer.addr(), name = %self.name, "client left");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub async fn handle(state: ServerState, socket: TcpStream, addr: SocketAddr) -> Result<()> {
    let (mut reader, writer) = socket.into_split();

    let (peer, outbox) = Peer::new(addr, state.config.outbox_capacity);
    let writer_task = tokio::spawn(outbox.run(writer));

    let mut frames = FrameBuffer::new(state.config.max_frame_len);

    let result = serve(&state, &mut reader, &mut frames, peer).await;

    finish_writer(writer_task, addr).await;
    debug!(peer = %addr, "disconnected");

    result
}

async fn serve<R>(
    state: &ServerState,
    reader: &mut R,
    frames: &mut FrameBuffer,
    peer: Peer,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut session) = await_join(state, reader, frames, &peer).await? else {
        return Ok(());
    };
    drop(peer);

    run_joined(state, &mut session, reader, frames).await
}

async fn await_join<R>(
    state: &ServerState,
    reader: &mut R,
    frames: &mut FrameBuffer,
    peer: &Peer,
) -> Result<Option<Session>>
where
    R: AsyncRead + Unpin,
{
    loop {
        for frame in frames.frames() {
            match protocol::decode(&frame) {
                Ok(ClientMessage::Join { from }) => return admit(state, peer, from.as_deref()),
                Ok(other) => debug!(peer = %peer.addr(), ?other, "ignoring message before join"),
                Err(err) => debug!(peer = %peer.addr(), error = %err, "dropping frame before join"),
            }
        }

        if !read_more(reader, frames, peer).await? {
            return Ok(None);
        }
    }
}

fn admit(state: &ServerState, peer: &Peer, requested: Option<&str>) -> Result<Option<Session>> {
    let ack = codec::encode(&ServerMessage::accepted())?;

    let outcome = protocol::validate_name(requested, state.config.max_name_len).and_then(|name| {
        state.registry().register(&name, peer.clone(), |peer| {
            // Queued before the entry is visible, so the ack precedes any broadcast.
            if let Err(err) = peer.send(ack) {
                debug!(peer = %peer.addr(), error = %err, "could not queue join ack");
            }
        })?;
        Ok(name)
    });

    let name = match outcome {
        Ok(name) => name,
        Err(err) => {
            info!(peer = %peer.addr(), requested = ?requested, error = %err, "join rejected");
            let rejection = codec::encode(&ServerMessage::rejected(err.reason()))?;
            if let Err(err) = peer.send(rejection) {
                debug!(peer = %peer.addr(), error = %err, "could not queue join rejection");
            }
            return Ok(None);
        }
    };

    info!(peer = %peer.addr(), name = %name, "client joined");

    let session = Session {
        router: state.router.clone(),
        name,
        peer: peer.clone(),
        limiter: RateLimiter::new(state.config.rate_limit, RATE_WINDOW),
    };

    state.router.broadcast_except(
        &ServerMessage::system(format!("{} joined", session.name)),
        &session.name,
    );
    // Everyone, the joiner included, learns the new roster.
    state.router.push_online_list();

    Ok(Some(session))
}

async fn run_joined<R>(
    state: &ServerState,
    session: &mut Session,
    reader: &mut R,
    frames: &mut FrameBuffer,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        for frame in frames.frames() {
            if dispatch(state, session, &frame) == Flow::Quit {
                debug!(peer = %session.peer.addr(), name = %session.name, "client quit");
                return Ok(());
            }
        }

        if !read_more(reader, frames, &session.peer).await? {
            return Ok(());
        }
    }
}

fn dispatch(state: &ServerState, session: &mut Session, frame: &[u8]) -> Flow {
    let router = &state.router;
    let (name, peer) = (session.name.as_str(), &session.peer);

    match protocol::decode(frame) {
        Ok(ClientMessage::Message { to, msg }) => {
            if session.limiter.as_mut().is_some_and(|limiter| !limiter.allow()) {
                debug!(peer = %peer.addr(), name, "rate limited");
                router.reply(name, peer, &ServerMessage::error("rate_limited"));
            } else {
                router.send_chat(name, peer, &to, msg);
            }
        }
        Ok(ClientMessage::ListRequest) => router.send_online_list(name, peer),
        Ok(ClientMessage::Join { .. }) => {
            router.reply(name, peer, &ServerMessage::error("already_joined"));
        }
        Ok(ClientMessage::Quit) => return Flow::Quit,
        Err(err) => {
            debug!(peer = %peer.addr(), name, error = %err, "bad frame");
            if let Some(notice) = err.notice() {
                router.reply(name, peer, &notice);
            }
        }
    }

    Flow::Continue
}

/// Waits for more input. `Ok(false)` is a normal end of the connection: the
/// peer closed its side, reset it, or the server asked this handler to stop.
async fn read_more<R>(reader: &mut R, frames: &mut FrameBuffer, peer: &Peer) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    select! {
        read = frames.fill(reader) => match read {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(err) if is_disconnect(&err) => {
                debug!(peer = %peer.addr(), error = %err, "connection dropped");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        },
        () = peer.closed() => {
            debug!(peer = %peer.addr(), "closing on server request");
            Ok(false)
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn finish_writer(mut writer: JoinHandle<io::Result<()>>, addr: SocketAddr) {
    match timeout(DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(peer = %addr, error = %err, "writer stopped"),
        Ok(Err(err)) => warn!(peer = %addr, error = %err, "writer task failed"),
        Err(_) => {
            warn!(peer = %addr, "timed out flushing outbox, dropping connection");
            writer.abort();
        }
    }
}
