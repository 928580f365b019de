//! Control service for querying a running server.
//!
//! Requests and replies are single JSON objects, one per line, exchanged over
//! a Unix domain socket:
//!
//! ```text
//! -> {"method":"Server.Addr","params":"db"}
//! <- {"result":"127.0.0.1:15432"}
//! ```

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
use tracing::{debug, info, warn};

use crate::{
    error::{PassageError, PassageResult},
    listener::{ListenAddr, Listener, handler},
    manager::PassageManager,
    ssh::BoxedStream,
};

/// Default control socket path
pub const DEFAULT_RPC_ADDR: &str = "/tmp/passage.sock";

/// Longest accepted request line, newline included
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    /// Bound local address of the named passage
    #[serde(rename = "Server.Addr")]
    Addr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    Result(String),
    Error(String),
}

impl RpcResponse {
    fn from_result(result: PassageResult<String>) -> Self {
        match result {
            Ok(value) => RpcResponse::Result(value),
            Err(e) => RpcResponse::Error(e.to_string()),
        }
    }
}

/// Serves control requests against a [`PassageManager`]
pub struct RpcServer {
    path: PathBuf,
    listener: Listener,
}

impl RpcServer {
    /// Bind the control socket at `path` and start serving
    pub async fn listen(manager: Arc<PassageManager>, path: impl AsRef<Path>) -> PassageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let serve = handler(move |stream| serve(Arc::clone(&manager), stream));

        let listener = Listener::new(ListenAddr::Unix(path.clone()), serve);
        listener.start().await?;
        info!(socket = %path.display(), "control service listening");

        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop serving and remove the socket file
    pub async fn close(&self) -> PassageResult<()> {
        self.listener.close().await
    }
}

async fn serve(manager: Arc<PassageManager>, stream: BoxedStream) -> PassageResult<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut stream)
            .take(MAX_REQUEST_LINE as u64)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }

        if !line.ends_with('\n') && read == MAX_REQUEST_LINE {
            warn!(limit = MAX_REQUEST_LINE, "control request too long, closing connection");
            let response = RpcResponse::Error(format!(
                "request exceeds {MAX_REQUEST_LINE} bytes"
            ));
            return reply(&mut stream, &response).await;
        }

        let response = match serde_json::from_str::<RpcRequest>(line.trim()) {
            Ok(request) => {
                debug!(?request, "control request");
                RpcResponse::from_result(dispatch(&manager, request).await)
            }
            Err(e) => RpcResponse::Error(format!("invalid request: {e}")),
        };
        reply(&mut stream, &response).await?;
    }
}

async fn reply(stream: &mut BufReader<BoxedStream>, response: &RpcResponse) -> PassageResult<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await?;
    Ok(())
}

async fn dispatch(manager: &PassageManager, request: RpcRequest) -> PassageResult<String> {
    match request {
        RpcRequest::Addr(name) => manager.addr(&name).await,
    }
}

/// Client side of the control service
pub struct RpcClient {
    stream: BufReader<UnixStream>,
}

impl RpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> PassageResult<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            PassageError::Rpc(format!(
                "failed to connect to control socket {}: {e}",
                path.display()
            ))
        })?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    pub async fn request(&mut self, request: &RpcRequest) -> PassageResult<RpcResponse> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');
        self.stream.get_mut().write_all(json.as_bytes()).await?;
        self.stream.get_mut().flush().await?;

        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(PassageError::Rpc("control connection closed".to_string()));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Bound local address of the named passage
    pub async fn addr(&mut self, name: &str) -> PassageResult<String> {
        match self.request(&RpcRequest::Addr(name.to_string())).await? {
            RpcResponse::Result(addr) => Ok(addr),
            RpcResponse::Error(e) => Err(PassageError::Rpc(e)),
        }
    }
}

/// Turn a bound address into one a local client can dial, replacing a
/// wildcard host with the loopback address.
pub fn format_dialable(addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(socket) if socket.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, socket.port())).to_string()
        }
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, ServerConfig},
        manager::Connector,
        ssh::{Connection, tests::DirectConnection},
    };

    struct Direct;

    impl Connector for Direct {
        fn connect(&self, _server: &ServerConfig) -> Arc<dyn Connection> {
            Arc::new(DirectConnection)
        }
    }

    async fn running_manager() -> Arc<PassageManager> {
        let manager = Arc::new(PassageManager::with_connector(Arc::new(Direct)));
        let config = Config::from_yaml(
            r#"
servers:
  web:
    user: root
    address: 10.0.0.1
    passages:
      db: "5432"
"#,
        )
        .unwrap();
        manager.load(config).await.unwrap();
        manager
    }

    #[test]
    fn test_wire_format() {
        let request = RpcRequest::Addr("db".to_string());
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"method":"Server.Addr","params":"db"}"#
        );
        assert_eq!(
            serde_json::to_string(&RpcResponse::Result("127.0.0.1:1".to_string())).unwrap(),
            r#"{"result":"127.0.0.1:1"}"#
        );
        assert_eq!(
            serde_json::to_string(&RpcResponse::Error("boom".to_string())).unwrap(),
            r#"{"error":"boom"}"#
        );
    }

    #[test]
    fn test_format_dialable() {
        assert_eq!(format_dialable("0.0.0.0:8400"), "127.0.0.1:8400");
        assert_eq!(format_dialable("[::]:8400"), "127.0.0.1:8400");
        assert_eq!(format_dialable("10.0.0.1:8400"), "10.0.0.1:8400");
        assert_eq!(format_dialable("/tmp/passage.sock"), "/tmp/passage.sock");
    }

    #[tokio::test]
    async fn test_rpc_addr() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("passage.sock");
        let manager = running_manager().await;
        let server = RpcServer::listen(Arc::clone(&manager), &socket).await.unwrap();

        let mut client = RpcClient::connect(&socket).await.unwrap();
        let addr = client.addr("db").await.unwrap();
        assert_eq!(addr, manager.addr("db").await.unwrap());

        let err = client.addr("nope").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "RPC error: unable to find a passage with name \"nope\""
        );

        // the connection stays usable after an error reply
        assert_eq!(client.addr("db").await.unwrap(), addr);

        server.close().await.unwrap();
        assert!(!socket.exists());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("passage.sock");
        let manager = running_manager().await;
        let server = RpcServer::listen(Arc::clone(&manager), &socket).await.unwrap();

        let mut stream = BufReader::new(UnixStream::connect(&socket).await.unwrap());
        stream
            .get_mut()
            .write_all(b"{\"method\":\"Server.Kill\"}\n")
            .await
            .unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let response: RpcResponse = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(response, RpcResponse::Error(ref e) if e.starts_with("invalid request")));

        let mut client = RpcClient::connect(&socket).await.unwrap();
        assert!(client.addr("db").await.is_ok());

        server.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("passage.sock");
        let manager = running_manager().await;
        let server = RpcServer::listen(Arc::clone(&manager), &socket).await.unwrap();

        let mut stream = BufReader::new(UnixStream::connect(&socket).await.unwrap());
        let flood = vec![b'x'; MAX_REQUEST_LINE + 1];
        stream.get_mut().write_all(&flood).await.unwrap();

        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let response: RpcResponse = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(response, RpcResponse::Error(ref e) if e.contains("exceeds")));

        // the server hangs up after refusing
        line.clear();
        assert_eq!(stream.read_line(&mut line).await.unwrap_or(0), 0);

        let mut client = RpcClient::connect(&socket).await.unwrap();
        assert!(client.addr("db").await.is_ok());

        server.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("passage.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());

        let manager = running_manager().await;
        let server = RpcServer::listen(Arc::clone(&manager), &socket).await.unwrap();
        assert!(RpcServer::listen(Arc::clone(&manager), &socket).await.is_err());

        let mut client = RpcClient::connect(&socket).await.unwrap();
        assert!(client.addr("db").await.is_ok());

        server.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_path_must_not_be_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passage.yaml");
        std::fs::write(&path, b"servers: {}\n").unwrap();

        let manager = running_manager().await;
        let err = RpcServer::listen(Arc::clone(&manager), &path).await.err().unwrap();
        assert!(matches!(err, PassageError::Listener(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"servers: {}\n");

        manager.close().await.unwrap();
    }
}
