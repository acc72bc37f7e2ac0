//! TCP server for line-protocol connections.
//!
//! Owns the listener, the lifecycle state and the shared counters. Every
//! accepted connection is counted and then served by its own task; `stop`
//! closes the listener and waits for those tasks to finish.
//!
//! ```text
//!   Idle --start()--> Running --stop()--> Stopping
//!    ^   (bind error)
//!    +-------+
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::commands::CommandDispatcher;
use crate::config::Config;
use crate::listener;
use crate::session::{ConnectionSession, SessionEnd, SessionError};
use crate::status::{ServerStats, StatusSnapshot, StatusSource};
use crate::wait_group::WaitGroup;

/// Lifecycle state of a [`Server`]. Never returns to `Idle` once running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Running,
            _ => ServerState::Stopping,
        }
    }
}

/// Server lifecycle errors
#[derive(Debug)]
pub enum ServerError {
    /// `start` called on a server that is not idle.
    AlreadyRunning,
    /// The listener could not be bound; the server stays idle.
    Bind { address: String, source: io::Error },
    /// The accept loop could not be told to release the listener.
    Close(&'static str),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "server is already running"),
            ServerError::Bind { address, source } => {
                write!(f, "failed to start server on {address}: {source}")
            }
            ServerError::Close(reason) => write!(f, "failed to close listener: {reason}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    state: AtomicU8,
    started: Notify,
    stats: Arc<ServerStats>,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Arc<WaitGroup>,
}

impl Server {
    /// Create a server for `host:port` with default settings otherwise.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(Config {
            host: host.into(),
            port,
            ..Config::default()
        })
    }

    /// Create a server from a resolved configuration.
    pub fn with_config(config: Config) -> Self {
        let stats = ServerStats::new(config.address());
        let status: Arc<dyn StatusSource> = stats.clone();
        let dispatcher = Arc::new(CommandDispatcher::with_status(status));
        let (shutdown, _) = watch::channel(false);

        Server {
            config,
            state: AtomicU8::new(ServerState::Idle as u8),
            started: Notify::new(),
            stats,
            dispatcher,
            shutdown,
            tasks: WaitGroup::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Wait until the server has left `Idle`.
    ///
    /// A stop requested while `start` is still binding is a no-op; callers
    /// that must not lose such a request wait here before calling `stop`.
    pub async fn wait_started(&self) {
        loop {
            let started = self.started.notified();
            if self.state() != ServerState::Idle {
                return;
            }
            started.await;
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stats.bound_address()
    }

    /// Current uptime and connection counters. Never blocks.
    pub fn status(&self) -> StatusSnapshot {
        self.stats.snapshot()
    }

    /// Bind the listener and accept connections until [`Server::stop`] is
    /// called.
    ///
    /// Completes once the accept loop has exited and the listener is closed.
    /// Sessions still in flight at that point keep running; `stop` waits for
    /// them.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.state() != ServerState::Idle {
            return Err(ServerError::AlreadyRunning);
        }

        let address = self.config.address();
        let listener = listener::bind(&self.config.host, self.config.port, self.config.backlog)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { address, source })?;

        // Subscribe before going live so a stop() racing with startup is seen.
        let mut shutdown = self.shutdown.subscribe();
        let _accepting = self.tasks.add();

        self.state
            .compare_exchange(
                ServerState::Idle as u8,
                ServerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| ServerError::AlreadyRunning)?;

        self.stats.mark_started(bound);
        self.started.notify_waiters();
        info!(
            address = %bound,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Echo server listening"
        );

        self.accept_loop(listener, &mut shutdown).await;

        info!(address = %bound, "Listener closed");
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener, shutdown: &mut watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) if self.state() == ServerState::Running => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                    Err(_) => break,
                },
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        // Counted before the task starts reading so `status` never misses it.
        let connection = self.stats.connection_opened();
        let in_flight = self.tasks.add();
        let session = ConnectionSession::new(
            stream,
            Arc::clone(&self.dispatcher),
            self.config.session_limits(),
        );

        debug!(peer = %peer, "New connection");

        tokio::spawn(async move {
            match session.run().await {
                Ok(SessionEnd::Disconnected) => debug!(peer = %peer, "Connection closed by client"),
                Ok(SessionEnd::Quit) => debug!(peer = %peer, "Client quit"),
                Err(SessionError::IdleTimeout(after)) => {
                    info!(peer = %peer, idle_secs = after.as_secs(), "Closing idle connection");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
            }

            // The stream was dropped by `run`; release the counters after it.
            drop(connection);
            drop(in_flight);
        });
    }

    /// Stop accepting and wait for every in-flight session to finish.
    ///
    /// Does nothing unless the server is running, so repeated calls are
    /// harmless.
    pub async fn stop(&self) -> Result<(), ServerError> {
        if self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        info!(
            active = self.stats.active_connections(),
            "Stopping server, waiting for connections to close"
        );

        let closed = self
            .shutdown
            .send(true)
            .map_err(|_| ServerError::Close("accept loop is no longer running"));

        self.tasks.wait().await;

        info!(
            total = self.stats.total_connections(),
            "All connections closed"
        );
        closed
    }
}

impl StatusSource for Server {
    fn status(&self) -> StatusSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.address())
            .field("state", &self.state())
            .field("active_connections", &self.stats.active_connections())
            .finish()
    }
}
