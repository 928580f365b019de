use std::{fmt, str::FromStr};

use crate::{
    config::RemoteConfig,
    container::ContainerRemote,
    error::{PassageError, PassageResult},
    ssh::Connection,
};

/// Transport family a remote target is reached with
///
/// Targets are opened as SSH direct-tcpip channels, so only the TCP family is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

impl FromStr for Network {
    type Err = PassageError;

    fn from_str(s: &str) -> PassageResult<Self> {
        match s {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(PassageError::Network(format!(
                "unsupported network {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete address a tunnel is opened to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    pub network: Network,
    pub host: String,
    pub port: u16,
}

impl RemoteAddr {
    pub fn new(network: Network, host: impl Into<String>, port: u16) -> Self {
        Self {
            network,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A statically known target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRemote {
    network: Network,
    host: String,
    port: u16,
}

impl AddressRemote {
    pub fn new(network: &str, host: &str, port: &str) -> PassageResult<Self> {
        if host.is_empty() {
            return Err(PassageError::Config("remote host cannot be empty".to_string()));
        }

        Ok(Self {
            network: network.parse()?,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: parse_port(port)?,
        })
    }

    pub fn localhost(network: &str, port: &str) -> PassageResult<Self> {
        Self::new(network, "127.0.0.1", port)
    }

    pub fn addr(&self) -> RemoteAddr {
        RemoteAddr::new(self.network, self.host.clone(), self.port)
    }
}

impl fmt::Display for AddressRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.network)
    }
}

/// Where a passage forwards its connections to
#[derive(Debug)]
pub enum Remote {
    Address(AddressRemote),
    Container(ContainerRemote),
}

impl Remote {
    /// Resolve the target, querying through `conn` when the variant needs it.
    pub async fn resolve(&self, conn: &dyn Connection) -> PassageResult<RemoteAddr> {
        match self {
            Remote::Address(remote) => Ok(remote.addr()),
            Remote::Container(remote) => remote.resolve(conn).await,
        }
    }

    /// Build a remote from its configuration entry.
    pub fn from_config(config: &RemoteConfig) -> PassageResult<Self> {
        match config {
            RemoteConfig::Literal(literal) => literal.parse(),
            RemoteConfig::Detailed(detail) => {
                let network = detail.network.as_deref().unwrap_or("tcp");
                match detail.kind.as_str() {
                    "tcp" => {
                        let address = detail.address.as_deref().unwrap_or_default();
                        match &detail.port {
                            Some(port) => Ok(Remote::Address(AddressRemote::new(
                                network,
                                address,
                                &port.to_string(),
                            )?)),
                            None => {
                                let (host, port) = split_host_port(address)?;
                                Ok(Remote::Address(AddressRemote::new(network, host, port)?))
                            }
                        }
                    }
                    "container" => {
                        let name = detail.container.as_deref().unwrap_or_default();
                        let port = detail
                            .port
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        Ok(Remote::Container(ContainerRemote::new(network, name, &port)?))
                    }
                    other => Err(PassageError::Config(format!(
                        "invalid remote type {other:?}"
                    ))),
                }
            }
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::Address(remote) => remote.fmt(f),
            Remote::Container(remote) => remote.fmt(f),
        }
    }
}

impl FromStr for Remote {
    type Err = PassageError;

    /// Parse `[:]port[/network]`, `host:port[/network]` or
    /// `kind=value:port[/network]`.
    fn from_str(value: &str) -> PassageResult<Self> {
        let invalid = || PassageError::Config(format!("invalid remote format: {value:?}"));

        let (target, network) = match value.split_once('/') {
            Some((_, network)) if network.contains('/') => return Err(invalid()),
            Some((target, network)) => (target, network),
            None => (value, "tcp"),
        };
        let target = target.strip_prefix(':').unwrap_or(target);

        let parts: Vec<&str> = target.split(':').collect();
        match parts.as_slice() {
            [port] => Ok(Remote::Address(AddressRemote::localhost(network, port)?)),
            [address, port] => match address.split('=').collect::<Vec<_>>().as_slice() {
                [host] => Ok(Remote::Address(AddressRemote::new(network, host, port)?)),
                ["container", name] => Ok(Remote::Container(ContainerRemote::new(
                    network, name, port,
                )?)),
                [kind, _] => Err(PassageError::Config(format!(
                    "invalid remote kind: {kind:?}"
                ))),
                _ => Err(PassageError::Config(format!(
                    "invalid remote address format: {address:?}"
                ))),
            },
            _ => Err(invalid()),
        }
    }
}

pub(crate) fn parse_port(port: &str) -> PassageResult<u16> {
    port.parse::<u16>()
        .map_err(|_| PassageError::Config(format!("invalid port {port:?}")))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(address: &str) -> PassageResult<(&str, &str)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| PassageError::Config(format!("missing port in address {address:?}")))?;

    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::tests::UnreachableConnection;

    #[tokio::test]
    async fn test_address_remote_resolve() {
        let remote = Remote::Address(AddressRemote::new("tcp", "127.0.0.1", "42").unwrap());
        let addr = remote.resolve(&UnreachableConnection).await.unwrap();

        assert_eq!(addr.network, Network::Tcp);
        assert_eq!(addr.to_string(), "127.0.0.1:42");
    }

    #[tokio::test]
    async fn test_localhost_remote_resolve() {
        let remote = Remote::Address(AddressRemote::localhost("tcp", "42").unwrap());
        let addr = remote.resolve(&UnreachableConnection).await.unwrap();

        assert_eq!(addr.to_string(), "127.0.0.1:42");
        assert_eq!(remote.to_string(), "127.0.0.1:42/tcp");
    }

    #[test]
    fn test_unsupported_network() {
        assert!(AddressRemote::new("udp", "127.0.0.1", "42").is_err());
        assert!(AddressRemote::new("unix", "127.0.0.1", "42").is_err());
        assert!(AddressRemote::new("tcp6", "::1", "42").is_ok());
    }

    #[test]
    fn test_ipv6_display() {
        let remote = AddressRemote::new("tcp6", "::1", "42").unwrap();
        assert_eq!(remote.to_string(), "[::1]:42/tcp6");
    }

    #[test]
    fn test_parse_host_port() {
        let remote: Remote = "127.0.0.1:42/tcp".parse().unwrap();
        assert_eq!(remote.to_string(), "127.0.0.1:42/tcp");

        let remote: Remote = "db.internal:5432".parse().unwrap();
        assert_eq!(remote.to_string(), "db.internal:5432/tcp");
    }

    #[test]
    fn test_parse_port_shorthand() {
        let remote: Remote = "42".parse().unwrap();
        assert_eq!(remote.to_string(), "127.0.0.1:42/tcp");

        let remote: Remote = ":42".parse().unwrap();
        assert_eq!(remote.to_string(), "127.0.0.1:42/tcp");

        let remote: Remote = ":42/tcp4".parse().unwrap();
        assert_eq!(remote.to_string(), "127.0.0.1:42/tcp4");
    }

    #[test]
    fn test_parse_container() {
        let remote: Remote = "container=foo:42".parse().unwrap();
        assert!(matches!(remote, Remote::Container(_)));
        assert_eq!(remote.to_string(), "<container=foo>:42/tcp");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("a:b:c".parse::<Remote>().is_err());
        assert!("volume=foo:42".parse::<Remote>().is_err());
        assert!("127.0.0.1:42/tcp/extra".parse::<Remote>().is_err());
        assert!("127.0.0.1:port".parse::<Remote>().is_err());
        assert!("127.0.0.1:42/udp".parse::<Remote>().is_err());
    }
}
