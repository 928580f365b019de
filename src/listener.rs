use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;

use futures::{FutureExt, future::BoxFuture};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::{debug, warn};

use crate::{
    error::{PassageError, PassageResult},
    ssh::BoxedStream,
};

/// Per-connection callback invoked for every accepted stream
pub type Handler = Arc<dyn Fn(BoxedStream) -> BoxFuture<'static, PassageResult<()>> + Send + Sync>;

/// Wrap an async function into a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(BoxedStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PassageResult<()>> + Send + 'static,
{
    Arc::new(move |stream| f(stream).boxed())
}

/// Pause after an unexpected accept error, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where a listener binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    /// A host name, resolved when the listener binds
    Host { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = PassageError;

    /// Parse `ip:port`, `host:port`, `:port`, `localhost:port`, `unix:/path`
    /// or `/path`. Host names are only resolved when binding.
    fn from_str(s: &str) -> PassageResult<Self> {
        #[cfg(unix)]
        {
            if let Some(path) = s.strip_prefix("unix:") {
                return Ok(ListenAddr::Unix(PathBuf::from(path)));
            }
            if s.starts_with('/') {
                return Ok(ListenAddr::Unix(PathBuf::from(s)));
            }
        }

        let invalid = |e: std::net::AddrParseError| {
            PassageError::Network(format!("invalid bind address {s:?}: {e}"))
        };

        if let Some(port) = s.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| PassageError::Network(format!("invalid bind port in {s:?}")))?;
            return Ok(ListenAddr::Tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
        }

        if let Some(port) = s.strip_prefix("localhost:") {
            let port = port
                .parse::<u16>()
                .map_err(|_| PassageError::Network(format!("invalid bind port in {s:?}")))?;
            return Ok(ListenAddr::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port))));
        }

        let not_an_ip = match s.parse::<SocketAddr>() {
            Ok(addr) => return Ok(ListenAddr::Tcp(addr)),
            Err(e) => e,
        };

        match s.rsplit_once(':') {
            Some((host, port)) if is_host_name(host) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| PassageError::Network(format!("invalid bind port in {s:?}")))?;
                Ok(ListenAddr::Host {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(invalid(not_an_ip)),
        }
    }
}

/// A DNS-style name: dot-separated labels of letters, digits and hyphens
fn is_host_name(host: &str) -> bool {
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => addr.fmt(f),
            ListenAddr::Host { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Acceptor {
    async fn bind(addr: &ListenAddr) -> PassageResult<(Self, String)> {
        match addr {
            ListenAddr::Tcp(socket) => Self::bind_tcp(addr, TcpListener::bind(*socket).await),
            ListenAddr::Host { host, port } => {
                Self::bind_tcp(addr, TcpListener::bind((host.as_str(), *port)).await)
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                remove_stale_socket(path).await?;

                let listener = UnixListener::bind(path).map_err(|e| {
                    PassageError::Listener(format!(
                        "error creating listener on {}: {e}",
                        path.display()
                    ))
                })?;
                Ok((Acceptor::Unix(listener, path.clone()), path.display().to_string()))
            }
        }
    }

    fn bind_tcp(
        addr: &ListenAddr,
        bound: std::io::Result<TcpListener>,
    ) -> PassageResult<(Self, String)> {
        let listener = bound.map_err(|e| {
            PassageError::Listener(format!("error creating listener on {addr}: {e}"))
        })?;
        let local = listener.local_addr()?.to_string();
        Ok((Acceptor::Tcp(listener), local))
    }

    async fn accept(&self) -> std::io::Result<(BoxedStream, String)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }
}

/// Remove a socket file left behind by a process that is gone. A socket that
/// still accepts connections, or a path that is not a socket, is an error.
#[cfg(unix)]
async fn remove_stale_socket(path: &std::path::Path) -> PassageResult<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_socket() {
        return Err(PassageError::Listener(format!(
            "{} exists and is not a socket",
            path.display()
        )));
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(PassageError::Listener(format!(
            "socket {} is already in use",
            path.display()
        )));
    }

    debug!(socket = %path.display(), "removing stale socket");
    std::fs::remove_file(path)?;
    Ok(())
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Acceptor::Unix(_, path) = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

enum State {
    Unstarted,
    Binding,
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Closed,
}

/// Accepts connections on a local address and hands each one to a handler
pub struct Listener {
    addr: ListenAddr,
    handler: Handler,
    bound: OnceLock<String>,
    connections: Arc<AtomicUsize>,
    state: Mutex<State>,
}

impl Listener {
    pub fn new(addr: ListenAddr, handler: Handler) -> Self {
        Self {
            addr,
            handler,
            bound: OnceLock::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(State::Unstarted),
        }
    }

    /// Bind the address and start accepting in the background
    pub async fn start(&self) -> PassageResult<()> {
        {
            let mut state = self.lock_state();
            if !matches!(*state, State::Unstarted) {
                return Err(PassageError::Listener(format!(
                    "listener on {} was already started",
                    self.addr
                )));
            }
            *state = State::Binding;
        }

        let bound = Acceptor::bind(&self.addr).await;

        let mut state = self.lock_state();
        if !matches!(*state, State::Binding) {
            return Err(PassageError::Listener(format!(
                "listener on {} was closed while starting",
                self.addr
            )));
        }
        let (acceptor, local) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                *state = State::Unstarted;
                return Err(e);
            }
        };
        let _ = self.bound.set(local.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            acceptor,
            local,
            Arc::clone(&self.handler),
            Arc::clone(&self.connections),
            shutdown_rx,
        ));

        *state = State::Running {
            shutdown: shutdown_tx,
            task,
        };
        Ok(())
    }

    /// Stop accepting, release the socket, then end every connection still
    /// being handled. Returns once all of them are gone.
    pub async fn close(&self) -> PassageResult<()> {
        let state = std::mem::replace(&mut *self.lock_state(), State::Closed);
        let State::Running { shutdown, task } = state else {
            return Ok(());
        };

        let _ = shutdown.send(());
        task.await
            .map_err(|e| PassageError::Listener(format!("accept loop of {self} failed: {e}")))
    }

    /// The bound local address, once started
    pub fn local_addr(&self) -> Option<&str> {
        self.bound.get().map(String::as_str)
    }

    /// Number of accepted connections whose handler is still running
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), State::Running { .. })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.local_addr().unwrap_or("<nil>"))
    }
}

/// Decrements the live connection count when a handler task ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    acceptor: Acceptor,
    local: String,
    handler: Handler,
    connections: Arc<AtomicUsize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!(listener = %local, "listener closed, accept loop exiting");
                break;
            }
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = %local, peer = %peer, "accepted connection");
                    let guard = ConnectionGuard::new(Arc::clone(&connections));
                    let handler = Arc::clone(&handler);
                    let local = local.clone();
                    handlers.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = handler(stream).await {
                            warn!(listener = %local, peer = %peer, "error handling connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!(listener = %local, "error accepting connection: {}", e);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(acceptor);
    if !handlers.is_empty() {
        debug!(listener = %local, open = handlers.len(), "closing open connections");
    }
    handlers.shutdown().await;
}
