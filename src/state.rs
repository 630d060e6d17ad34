use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::Config;
use crate::registry::Registry;
use crate::router::Router;

/// Everything a connection handler shares with the rest of the server.
#[derive(Clone)]
pub struct ServerState {
    pub router: Router,
    pub config: Arc<Config>,
    shutdown: Arc<Notify>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        Self {
            router: Router::new(Registry::default()),
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }

    /// Asks the accept loop to stop. The request is kept until the loop
    /// next waits for it.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}
