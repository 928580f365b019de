//! Container address discovery through the Docker Engine API.
//!
//! The API is reached on the SSH server's loopback interface, so every request
//! travels over a stream opened by the passage's own [`Connection`].

use std::{collections::HashMap, fmt, sync::RwLock, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, client::conn::http1, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    error::{PassageError, PassageResult},
    remote::{Network, RemoteAddr, parse_port},
    ssh::{BoxedStream, Connection},
};

const DOCKER_HOST: &str = "localhost";
const DOCKER_PORT: u16 = 2375;
const CONTAINERS_PATH: &str = "/containers/json";
const BRIDGE_NETWORK: &str = "bridge";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// A target addressed by container name, resolved to the container's bridge IP
#[derive(Debug)]
pub struct ContainerRemote {
    network: Network,
    name: String,
    port: u16,
    address: RwLock<Option<String>>,
}

impl ContainerRemote {
    pub fn new(network: &str, name: &str, port: &str) -> PassageResult<Self> {
        if name.is_empty() {
            return Err(PassageError::Config(
                "container name cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            network: network.parse()?,
            name: name.to_string(),
            port: parse_port(port)?,
            address: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The discovered IP, if a resolution already succeeded.
    pub fn cached_address(&self) -> Option<String> {
        self.address
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolve the container's address, querying the API only the first time.
    pub async fn resolve(&self, conn: &dyn Connection) -> PassageResult<RemoteAddr> {
        if let Some(ip) = self.cached_address() {
            return Ok(RemoteAddr::new(self.network, ip, self.port));
        }

        // The stream open may dial and retry under the server's own limits,
        // only the API exchange is bounded by the request timeout.
        let endpoint = RemoteAddr::new(Network::Tcp, DOCKER_HOST, DOCKER_PORT);
        let stream = conn.open_stream(&endpoint).await?;
        let containers = timeout(REQUEST_TIMEOUT, list_containers(stream))
            .await
            .map_err(|_| PassageError::Timeout)??;
        let ip = self.match_container(&containers)?;

        info!(container = %self.name, ip = %ip, "resolved container address");
        *self
            .address
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ip.clone());

        Ok(RemoteAddr::new(self.network, ip, self.port))
    }

    fn match_container(&self, containers: &[ContainerSummary]) -> PassageResult<String> {
        let wanted = format!("/{}", self.name);
        let container = containers
            .iter()
            .find(|c| c.names.iter().any(|n| *n == wanted))
            .ok_or_else(|| PassageError::ContainerNotFound(self.name.clone()))?;

        container
            .network_settings
            .networks
            .get(BRIDGE_NETWORK)
            .map(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| PassageError::UnsupportedNetwork(self.name.clone()))
    }
}

impl fmt::Display for ContainerRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.cached_address().unwrap_or_default();
        write!(
            f,
            "<container={}>{}:{}/{}",
            self.name, address, self.port, self.network
        )
    }
}

async fn list_containers(stream: BoxedStream) -> PassageResult<Vec<ContainerSummary>> {
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("container API connection closed: {}", e);
        }
    });

    let request = Request::get(CONTAINERS_PATH)
        .header(header::HOST, DOCKER_HOST)
        .body(Empty::<Bytes>::new())
        .map_err(|e| PassageError::Http(e.to_string()))?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PassageError::Http(format!(
            "unexpected status {status} from {CONTAINERS_PATH}"
        )));
    }

    let body = response.into_body().collect().await?.to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| PassageError::Http(format!("invalid container list: {e}")))
}
