//! Management channel: a second listener that answers operator requests
//! (who is online, server-wide notices, shutdown) over the same
//! newline-delimited JSON framing as chat clients.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec::{self, FrameBuffer};
use crate::protocol::ServerMessage;
use crate::server::ACCEPT_BACKOFF;
use crate::state::ServerState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminRequest {
    GetUsers,
    Broadcast { message: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    BroadcastSent,
    ShuttingDown,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdminReply {
    Users {
        users: Vec<String>,
        count: usize,
    },
    Status {
        status: AdminStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivered: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

impl AdminReply {
    fn status(status: AdminStatus) -> Self {
        AdminReply::Status {
            status,
            delivered: None,
            msg: None,
        }
    }

    fn error<S: Into<String>>(msg: S) -> Self {
        AdminReply::Status {
            status: AdminStatus::Error,
            delivered: None,
            msg: Some(msg.into()),
        }
    }
}

/// Carries out one request. Shutdown is only acknowledged here; the caller
/// triggers it once the reply is on its way.
pub fn answer(state: &ServerState, request: &AdminRequest) -> AdminReply {
    match request {
        AdminRequest::GetUsers => {
            let users = state.registry().snapshot();
            AdminReply::Users {
                count: users.len(),
                users,
            }
        }
        AdminRequest::Broadcast { message } => {
            let delivered = state.router.broadcast(&ServerMessage::system(message.as_str()));
            info!(delivered, "admin broadcast");
            AdminReply::Status {
                status: AdminStatus::BroadcastSent,
                delivered: Some(delivered),
                msg: None,
            }
        }
        AdminRequest::Shutdown => AdminReply::status(AdminStatus::ShuttingDown),
    }
}

/// Accepts management connections until the task is aborted.
pub async fn serve(state: ServerState, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(peer = %peer, "admin connection");
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle(state, socket, peer).await {
                        warn!(peer = %peer, error = ?err, "admin connection error");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept admin connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle(state: ServerState, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let mut frames = FrameBuffer::new(state.config.max_frame_len);

    loop {
        for frame in frames.frames() {
            let request = serde_json::from_slice::<AdminRequest>(&frame);

            let reply = match &request {
                Ok(request) => answer(&state, request),
                Err(err) => {
                    debug!(peer = %peer, error = %err, "bad admin request");
                    AdminReply::error(err.to_string())
                }
            };
            writer.write_all(&codec::encode(&reply)?).await?;

            if matches!(request, Ok(AdminRequest::Shutdown)) {
                info!(peer = %peer, "shutdown requested over admin channel");
                state.request_shutdown();
                return Ok(());
            }
        }

        if frames.fill(&mut reader).await? == 0 {
            debug!(peer = %peer, "admin disconnected");
            return Ok(());
        }
    }
}
