use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chatrelay_store::Persistence;

use crate::connection;
use crate::error::ServerError;
use crate::frame::DEFAULT_MAX_FRAME_LEN;
use crate::handlers::HandlerState;
use crate::session::SessionRegistry;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration. Fixed for the life of the process.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    pub max_frame_len: usize,
    /// A connection that receives no bytes for this long is closed. The
    /// clock restarts whenever bytes arrive, so a slow upload is not idle.
    pub idle_timeout: Duration,
    /// Pause between handling a request and queueing its response.
    pub response_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            idle_timeout: Duration::from_secs(600),
            response_delay: Duration::from_millis(50),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bind the listener and start accepting connections in the background.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn Persistence>,
) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    let registry = Arc::new(SessionRegistry::new());
    let state = Arc::new(HandlerState::with_registry(store, Arc::clone(&registry)));
    let shutdown = CancellationToken::new();

    tracing::info!(
        addr = %local_addr,
        max_frame_len = config.max_frame_len,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "relay server started"
    );

    let task = tokio::spawn(accept_loop(listener, state, Arc::new(config), shutdown.clone()));

    Ok(ServerHandle {
        local_addr,
        registry,
        shutdown,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<HandlerState>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }
                    tokio::spawn(connection::serve_connection(
                        stream,
                        peer,
                        Arc::clone(&state),
                        Arc::clone(&config),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::info!("relay server stopped accepting");
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting new connections. Open connections run to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "accept loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_store::{Database, SqliteStore};

    fn store() -> Arc<dyn Persistence> {
        Arc::new(SqliteStore::new(Database::in_memory().unwrap()))
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:5001");
        assert_eq!(config.max_frame_len, 100 * 1024 * 1024);
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.response_delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn starts_on_ephemeral_port() {
        let handle = start(local_config(), store()).await.unwrap();
        assert!(handle.port() > 0);
        assert_eq!(handle.registry().online_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = start(local_config(), store()).await.unwrap();
        let config = ServerConfig {
            port: first.port(),
            ..local_config()
        };
        let err = start(config, store()).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let handle = start(local_config(), store()).await.unwrap();
        let addr = handle.local_addr();
        handle.shutdown().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
