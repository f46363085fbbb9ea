use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::broadcast,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    counters::{CounterKind, CounterStore, SharedCounters},
    error::{ServeError, SetupError},
    event::{EventLog, ServerEvent},
    handler::{ClientConnection, ConnectionSummary, handle_connection},
};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BACKLOG: u32 = 32;
pub const DEFAULT_CHUNK_SIZE: NonZeroUsize = NonZeroUsize::new(64).unwrap();
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub chunk_size: NonZeroUsize,
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: DEFAULT_BACKLOG,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// State every connection handler shares with the dispatcher.
pub(crate) struct ServerState {
    pub(crate) counters: Arc<dyn CounterStore>,
    pub(crate) events: EventLog,
    pub(crate) chunk_size: NonZeroUsize,
}

/// The accept loop: owns the listening socket and supervises one handler task
/// per accepted connection.
pub struct Server {
    listener: TcpListener,
    counters: Arc<dyn CounterStore>,
    events: EventLog,
    chunk_size: NonZeroUsize,
    drain_timeout: Duration,
}

impl Server {
    /// Creates, binds and starts listening on `config.listen`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &ServerConfig) -> Result<Self, SetupError> {
        let listener = open_listener(config.listen, config.backlog)?;
        Ok(Self::new(listener, config))
    }

    /// Wraps an already listening socket. `config.listen` and `config.backlog`
    /// are ignored.
    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            counters: Arc::new(SharedCounters::new()),
            events: EventLog::new(),
            chunk_size: config.chunk_size,
            drain_timeout: config.drain_timeout,
        }
    }

    pub fn with_counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn counters(&self) -> Arc<dyn CounterStore> {
        Arc::clone(&self.counters)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves or the listening socket
    /// fails for good, then stops every handler and waits for them to drain.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            counters,
            events,
            chunk_size,
            drain_timeout,
        } = self;
        let state = Arc::new(ServerState {
            counters,
            events,
            chunk_size,
        });
        let (stop_tx, _) = broadcast::channel(1);
        let mut handlers = JoinSet::new();
        let mut backoff = AcceptBackoff::default();
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        spawn_handler(&mut handlers, stream, peer, &state, &stop_tx);
                    }
                    Err(err) => match classify_accept_error(&err) {
                        AcceptErrorKind::Transient => {
                            let delay = backoff.next_delay();
                            warn!(error = ?err, ?delay, "failed to accept connection");
                            select! {
                                _ = &mut shutdown => {
                                    info!("shutdown requested");
                                    break Ok(());
                                }
                                _ = sleep(delay) => {}
                            }
                        }
                        AcceptErrorKind::Fatal => {
                            error!(error = ?err, "listening socket failed");
                            break Err(ServeError::Accept(err));
                        }
                    },
                },
                Some(joined) = handlers.join_next() => reap_handler(joined),
            }
        };

        drop(listener);
        drain_handlers(&mut handlers, &stop_tx, drain_timeout).await;
        info!(
            clients = state.counters.issued(CounterKind::ClientIds),
            messages = state.counters.issued(CounterKind::Messages),
            "server stopped"
        );

        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), ServeError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn open_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, SetupError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|source| SetupError::Create { addr, source })?;

    socket
        .set_reuseaddr(true)
        .map_err(|source| SetupError::Create { addr, source })?;
    socket
        .bind(addr)
        .map_err(|source| SetupError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| SetupError::Listen {
            addr,
            backlog,
            source,
        })
}

fn spawn_handler(
    handlers: &mut JoinSet<ConnectionSummary>,
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    stop_tx: &broadcast::Sender<()>,
) {
    let client_id = state.counters.next_value(CounterKind::ClientIds);
    state
        .events
        .emit(ServerEvent::Connected { client_id, peer });

    let connection = ClientConnection { stream, client_id };
    handlers.spawn(handle_connection(
        connection,
        Arc::clone(state),
        stop_tx.subscribe(),
    ));
}

fn reap_handler(joined: Result<ConnectionSummary, JoinError>) {
    match joined {
        Ok(summary) => debug!(
            client_id = summary.client_id,
            messages = summary.messages,
            bytes = summary.bytes,
            reason = %summary.reason,
            "connection handler finished"
        ),
        Err(err) if err.is_panic() => error!(error = ?err, "connection handler panicked"),
        Err(err) => debug!(error = ?err, "connection handler cancelled"),
    }
}

async fn drain_handlers(
    handlers: &mut JoinSet<ConnectionSummary>,
    stop_tx: &broadcast::Sender<()>,
    drain_timeout: Duration,
) {
    if handlers.is_empty() {
        return;
    }

    info!(active = handlers.len(), "stopping connection handlers");
    // Fails only when every handler has already dropped its receiver.
    let _ = stop_tx.send(());

    let drained = timeout(drain_timeout, async {
        while let Some(joined) = handlers.join_next().await {
            reap_handler(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = handlers.len(),
            "handlers did not stop in time; aborting them"
        );
        handlers.shutdown().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// Worth logging and retrying: the listening socket itself is still fine.
    Transient,
    /// The listening socket is unusable.
    Fatal,
}

/// Sorts an `accept` failure into retry-and-continue or stop.
///
/// Aborted or reset handshakes, interruptions, time-outs and descriptor or
/// memory exhaustion all leave the listener intact. Only errors that say the
/// listening socket is invalid or unsupported stop the dispatcher.
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    match err.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => AcceptErrorKind::Fatal,
        _ => AcceptErrorKind::Transient,
    }
}

/// Exponential back-off between failed accepts, reset by the next success.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => MIN_ACCEPT_BACKOFF,
            Some(previous) => (previous * 2).min(MAX_ACCEPT_BACKOFF),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}
