use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    error::PassageResult,
    listener::{ListenAddr, Listener, handler},
    remote::Remote,
    ssh::Connection,
};

/// A named local listener whose connections are tunneled to a remote target
/// through a shared connection
pub struct Passage {
    name: String,
    connection: Arc<dyn Connection>,
    remote: Arc<Remote>,
    listener: Listener,
}

impl Passage {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        remote: Remote,
        local: ListenAddr,
    ) -> Self {
        let name = name.into();
        let remote = Arc::new(remote);

        let tunnel = {
            let connection = Arc::clone(&connection);
            let remote = Arc::clone(&remote);
            let name = name.clone();
            handler(move |stream| {
                let connection = Arc::clone(&connection);
                let remote = Arc::clone(&remote);
                let name = name.clone();
                async move {
                    let addr = remote.resolve(connection.as_ref()).await?;
                    debug!(passage = %name, remote = %addr, "opening tunnel");
                    connection.tunnel(stream, &addr).await
                }
            })
        };

        Self {
            name,
            connection,
            remote,
            listener: Listener::new(local, tunnel),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Bind the local address and start forwarding
    pub async fn start(&self) -> PassageResult<()> {
        self.listener.start().await?;
        info!(passage = %self.name, "started {}", self);
        Ok(())
    }

    /// Stop accepting and tear down every tunnel still open
    pub async fn close(&self) -> PassageResult<()> {
        self.listener.close().await?;
        info!(passage = %self.name, "closed {}", self);
        Ok(())
    }

    /// The bound local address, `None` until started
    pub fn addr(&self) -> Option<&str> {
        self.listener.local_addr()
    }

    /// Number of connections currently being tunneled
    pub fn connections(&self) -> usize {
        self.listener.connections()
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }
}

impl fmt::Display for Passage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})-[{}]->({})", self.connection, self.remote, self.listener)
    }
}

impl fmt::Debug for Passage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passage")
            .field("name", &self.name)
            .field("connection", &self.connection.to_string())
            .field("remote", &self.remote.to_string())
            .field("local", &self.listener.to_string())
            .finish()
    }
}
