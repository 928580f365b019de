use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{
    client::{self, Handle},
    keys::{PublicKey, key::PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::{PassageError, PassageResult},
    remote::RemoteAddr,
};

/// Delay between two dial attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Any bidirectional byte stream a tunnel can copy through
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A route to remote addresses, shared by every passage of one server
#[async_trait]
pub trait Connection: fmt::Display + Send + Sync {
    /// Open a raw stream to `addr` through the connection.
    async fn open_stream(&self, addr: &RemoteAddr) -> PassageResult<BoxedStream>;

    /// Forward `local` to `addr` until both directions are done.
    async fn tunnel(&self, local: BoxedStream, addr: &RemoteAddr) -> PassageResult<()> {
        let remote = self.open_stream(addr).await?;
        copy_bidirectional(local, remote).await;
        Ok(())
    }
}

/// Copy both directions concurrently within the calling task and wait for
/// both to finish.
///
/// A direction that ends shuts down the writer it was feeding, so the peer
/// sees EOF and the sibling direction can drain. Dropping the future tears
/// down both streams.
pub async fn copy_bidirectional(local: BoxedStream, remote: BoxedStream) -> (u64, u64) {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = async {
        let copied = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        copied
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let sent = copied_bytes("local -> remote", upstream);
    let received = copied_bytes("remote -> local", downstream);
    debug!(sent, received, "tunnel closed");

    (sent, received)
}

fn copied_bytes(direction: &str, result: std::io::Result<u64>) -> u64 {
    result.unwrap_or_else(|e| {
        warn!(direction, "tunnel copy error: {}", e);
        0
    })
}

/// Everything needed to reach and authenticate against one SSH server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    pub user: String,
    pub timeout: Duration,
    pub retries: u32,
    pub key: Option<PathBuf>,
}

impl From<&ServerConfig> for SshTarget {
    fn from(config: &ServerConfig) -> Self {
        Self {
            address: config.address.clone(),
            user: config.user.clone(),
            timeout: config.timeout(),
            retries: config.retries(),
            key: config.key.as_deref().map(expand_home),
        }
    }
}

/// Expand a leading `~/` to the current user's home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// An established SSH session able to open forwarding channels
#[async_trait]
pub trait Session: Send + Sync {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> PassageResult<BoxedStream>;
}

/// Establishes sessions for an [`SshConnection`]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &SshTarget) -> PassageResult<Arc<dyn Session>>;
}

/// Lazily dialed SSH connection with bounded retry
///
/// The session is established by the first stream open and reused for the
/// lifetime of the connection.
pub struct SshConnection {
    target: SshTarget,
    dialer: Arc<dyn Dialer>,
    session: Mutex<Option<Arc<dyn Session>>>,
    retry_interval: Duration,
}

impl SshConnection {
    /// Create a new connection backed by the russh client
    pub fn new(target: SshTarget) -> Self {
        Self::with_dialer(target, Arc::new(RusshDialer))
    }

    pub fn with_dialer(target: SshTarget, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            target,
            dialer,
            session: Mutex::new(None),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Returns true once a session has been established
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn session(&self) -> PassageResult<Arc<dyn Session>> {
        let mut session = self.session.lock().await;
        if let Some(established) = session.as_ref() {
            return Ok(Arc::clone(established));
        }

        debug!("Dialing SSH server {}", self);
        let established = timeout(self.target.timeout, self.dialer.dial(&self.target))
            .await
            .map_err(|_| {
                PassageError::Ssh(format!(
                    "error dialing server {}: timed out after {:?}",
                    self.target.address, self.target.timeout
                ))
            })??;

        info!("SSH session established: {}", self);
        *session = Some(Arc::clone(&established));
        Ok(established)
    }

    async fn try_open(&self, addr: &RemoteAddr) -> PassageResult<BoxedStream> {
        let session = self.session().await?;
        session.open_direct_tcpip(&addr.host, addr.port).await
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_stream(&self, addr: &RemoteAddr) -> PassageResult<BoxedStream> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_open(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempts > self.target.retries => {
                    return Err(PassageError::Dial {
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        "Opening {} via {} failed (attempt {}/{}): {}",
                        addr,
                        self,
                        attempts,
                        self.target.retries + 1,
                        e
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }
}

impl fmt::Display for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target.user, self.target.address)
    }
}

/// russh client callbacks
struct ClientHandler {
    address: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // Host keys are not pinned, like `ssh -o StrictHostKeyChecking=no`
        debug!("Accepting host key of {}", self.address);
        Ok(true)
    }
}

/// Dials real SSH servers with russh
pub struct RusshDialer;

#[async_trait]
impl Dialer for RusshDialer {
    async fn dial(&self, target: &SshTarget) -> PassageResult<Arc<dyn Session>> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler {
            address: target.address.clone(),
        };

        let mut handle = client::connect(config, target.address.as_str(), handler)
            .await
            .map_err(|e| {
                PassageError::Ssh(format!("error dialing server {}: {e}", target.address))
            })?;

        let authenticated = match &target.key {
            Some(path) => authenticate_with_key(&mut handle, &target.user, path).await?,
            None => authenticate_with_agent(&mut handle, &target.user).await?,
        };
        if !authenticated {
            return Err(PassageError::Ssh(format!(
                "authentication failed for {}@{}",
                target.user, target.address
            )));
        }

        Ok(Arc::new(RusshSession { handle }))
    }
}

async fn authenticate_with_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    path: &PathBuf,
) -> PassageResult<bool> {
    let key = load_secret_key(path, None).map_err(|e| {
        PassageError::Ssh(format!("failed to load key {}: {e}", path.display()))
    })?;
    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();

    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?;

    Ok(result.success())
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> PassageResult<bool> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| PassageError::Ssh(format!("failed to connect to ssh-agent: {e}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| PassageError::Ssh(format!("failed to list agent identities: {e}")))?;

    for identity in identities {
        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        match handle
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => debug!("agent identity rejected for {}", user),
            Err(e) => debug!("agent authentication error for {}: {}", user, e),
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
) -> PassageResult<bool> {
    Err(PassageError::Ssh(
        "ssh-agent authentication is only supported on unix".to_string(),
    ))
}

struct RusshSession {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl Session for RusshSession {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> PassageResult<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port.into(), "127.0.0.1", 0)
            .await
            .map_err(|e| PassageError::Ssh(format!("error dialing remote {host}:{port}: {e}")))?;

        Ok(Box::new(channel.into_stream()))
    }
}
