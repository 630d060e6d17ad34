use anyhow::{Context, Result};
use std::{future::Future, net::SocketAddr, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{info, warn};

use crate::config::Config;
use crate::protocol::ServerMessage;
use crate::state::ServerState;

// Pause after a failed accept, e.g. when the process is out of descriptors.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    admin: Option<TcpListener>,
    state: ServerState,
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self> {
        let listen_addr = config.listen_addr();

        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;

        let admin = match config.admin_addr() {
            Some(admin_addr) => Some(
                TcpListener::bind(&admin_addr)
                    .await
                    .with_context(|| format!("failed to bind admin channel {admin_addr}"))?,
            ),
            None => None,
        };

        Ok(Self {
            listener,
            admin,
            state: ServerState::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Where the management channel listens, if it is enabled.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin
            .as_ref()
            .and_then(|admin| admin.local_addr().ok())
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Accepts connections until `shutdown` resolves or the management
    /// channel asks to stop, then tells every connected client the server is
    /// going away.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            admin,
            state,
        } = self;
        tokio::pin!(shutdown);

        let admin_task = admin.map(|admin| {
            if let Ok(addr) = admin.local_addr() {
                info!(addr = %addr, "admin channel listening");
            }
            tokio::spawn(crate::admin::serve(state.clone(), admin))
        });

        loop {
            select! {
                _ = &mut shutdown => break,
                () = state.shutdown_requested() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => spawn_handler(&state, socket, peer),
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        if let Some(admin_task) = admin_task {
            admin_task.abort();
        }

        let notified = state
            .router
            .broadcast(&ServerMessage::system("server shutting down"));
        info!(clients = notified, "server shutting down");

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_handler(state: &ServerState, socket: TcpStream, peer: SocketAddr) {
    let state = state.clone();

    info!(peer = %peer, "accepted connection");

    tokio::spawn(async move {
        if let Err(err) = crate::conn::handle(state, socket, peer).await {
            warn!(peer = %peer, error = ?err, "connection error");
        }
    });
}
