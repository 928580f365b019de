use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ServerConfig},
    error::{PassageError, PassageResult},
    fingerprint::Fingerprint,
    listener::ListenAddr,
    passage::Passage,
    remote::Remote,
    ssh::{Connection, SshConnection, SshTarget},
};

/// Builds the connection shared by the passages of one server
pub trait Connector: Send + Sync {
    fn connect(&self, server: &ServerConfig) -> Arc<dyn Connection>;
}

/// Connects over SSH with the `russh` client
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, server: &ServerConfig) -> Arc<dyn Connection> {
        Arc::new(SshConnection::new(SshTarget::from(server)))
    }
}

/// Snapshot of one running passage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassageStatus {
    pub name: String,
    pub connection: String,
    pub remote: String,
    pub local: String,
    pub connections: usize,
}

/// What the last load applied, used to diff the next one
#[derive(Debug, Default)]
struct Applied {
    servers: HashMap<String, Fingerprint>,
    passages: HashMap<String, AppliedPassage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedPassage {
    server: String,
    fingerprint: Fingerprint,
}

/// A passage as the incoming configuration wants it
struct Planned {
    name: String,
    applied: AppliedPassage,
    remote: Remote,
    local: ListenAddr,
}

/// Owns every connection and passage and keeps them in sync with the
/// configuration
pub struct PassageManager {
    connector: Arc<dyn Connector>,
    applied: Mutex<Applied>,
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
    passages: RwLock<HashMap<String, Arc<Passage>>>,
}

impl PassageManager {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SshConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            applied: Mutex::new(Applied::default()),
            connections: RwLock::new(HashMap::new()),
            passages: RwLock::new(HashMap::new()),
        }
    }

    /// Reconcile the running state with `config`.
    ///
    /// Connections and passages whose fingerprint did not change are kept as
    /// they are. A passage that fails to start does not stop the others; all
    /// such failures are returned together once the load is done.
    pub async fn load(&self, mut config: Config) -> PassageResult<()> {
        config.validate()?;
        let (servers, planned) = plan(&config)?;

        let mut applied = self.applied.lock().await;

        let connections = {
            let current = self.connections.read().await;
            let mut connections = HashMap::with_capacity(servers.len());
            for (name, fingerprint) in &servers {
                let reused = current
                    .get(name)
                    .filter(|_| applied.servers.get(name) == Some(fingerprint));
                let connection = match reused {
                    Some(connection) => Arc::clone(connection),
                    None => {
                        let connection = self.connector.connect(&config.servers[name]);
                        info!(server = %name, fingerprint = %fingerprint, "created connection {}", connection);
                        connection
                    }
                };
                connections.insert(name.clone(), connection);
            }
            connections
        };

        let wanted: HashMap<&str, &AppliedPassage> = planned
            .iter()
            .map(|p| (p.name.as_str(), &p.applied))
            .collect();
        let stale: Vec<String> = self
            .passages
            .read()
            .await
            .keys()
            .filter(|name| {
                wanted.get(name.as_str()).copied() != applied.passages.get(name.as_str())
            })
            .cloned()
            .collect();

        for name in stale {
            applied.passages.remove(&name);
            let removed = self.passages.write().await.remove(&name);
            if let Some(passage) = removed
                && let Err(e) = passage.close().await
            {
                warn!(passage = %name, "error closing passage: {}", e);
            }
        }

        *self.connections.write().await = connections.clone();
        applied.servers = servers;

        let mut failures = Vec::new();
        for planned in planned {
            if self.passages.read().await.contains_key(&planned.name) {
                debug!(passage = %planned.name, "passage unchanged");
                continue;
            }

            let Some(connection) = connections.get(&planned.applied.server) else {
                continue;
            };

            let passage = Arc::new(Passage::new(
                planned.name.clone(),
                Arc::clone(connection),
                planned.remote,
                planned.local,
            ));

            match passage.start().await {
                Ok(()) => {
                    self.passages
                        .write()
                        .await
                        .insert(planned.name.clone(), passage);
                    applied.passages.insert(planned.name, planned.applied);
                }
                Err(e) => {
                    warn!(passage = %planned.name, "failed to start passage: {}", e);
                    failures.push(PassageError::Passage {
                        name: planned.name,
                        source: Box::new(e),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PassageError::Load(failures))
        }
    }

    /// Stop every passage and forget all connections.
    ///
    /// Closing continues past failures; the first one is returned.
    pub async fn close(&self) -> PassageResult<()> {
        let mut applied = self.applied.lock().await;
        let passages: Vec<(String, Arc<Passage>)> = self.passages.write().await.drain().collect();

        let mut first_error = None;
        for (name, passage) in passages {
            if let Err(e) = passage.close().await {
                warn!(passage = %name, "error closing passage: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.connections.write().await.clear();
        *applied = Applied::default();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bound local address of a running passage
    pub async fn addr(&self, name: &str) -> PassageResult<String> {
        self.passages
            .read()
            .await
            .get(name)
            .and_then(|passage| passage.addr().map(str::to_string))
            .ok_or_else(|| PassageError::NoSuchPassage(name.to_string()))
    }

    pub async fn passage(&self, name: &str) -> Option<Arc<Passage>> {
        self.passages.read().await.get(name).cloned()
    }

    pub async fn connection(&self, server: &str) -> Option<Arc<dyn Connection>> {
        self.connections.read().await.get(server).cloned()
    }

    /// Names of the running passages, sorted
    pub async fn passage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.passages.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn status(&self) -> Vec<PassageStatus> {
        let mut status: Vec<PassageStatus> = self
            .passages
            .read()
            .await
            .iter()
            .map(|(name, passage)| PassageStatus {
                name: name.clone(),
                connection: passage.connection().to_string(),
                remote: passage.remote().to_string(),
                local: passage.addr().unwrap_or_default().to_string(),
                connections: passage.connections(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

impl Default for PassageManager {
    fn default() -> Self {
        Self::new()
    }
}

type ServerFingerprints = HashMap<String, Fingerprint>;

/// Fingerprint every server and build every passage's remote and bind address
/// before anything running is touched.
fn plan(config: &Config) -> PassageResult<(ServerFingerprints, Vec<Planned>)> {
    let mut servers = HashMap::with_capacity(config.servers.len());
    let mut planned = Vec::new();

    for (server_name, server) in &config.servers {
        let server_fingerprint = Fingerprint::server(server);

        for (name, passage) in &server.passages {
            planned.push(Planned {
                name: name.clone(),
                applied: AppliedPassage {
                    server: server_name.clone(),
                    fingerprint: Fingerprint::passage(passage, &server_fingerprint)?,
                },
                remote: Remote::from_config(&passage.remote)?,
                local: passage.local.parse()?,
            });
        }

        servers.insert(server_name.clone(), server_fingerprint);
    }

    Ok((servers, planned))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::ssh::tests::DirectConnection;

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
    }

    impl Connector for FakeConnector {
        fn connect(&self, _server: &ServerConfig) -> Arc<dyn Connection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Arc::new(DirectConnection)
        }
    }

    fn manager() -> (Arc<FakeConnector>, PassageManager) {
        let connector = Arc::new(FakeConnector::default());
        let manager = PassageManager::with_connector(connector.clone());
        (connector, manager)
    }

    fn config(yaml: &str) -> Config {
        Config::from_yaml(yaml).unwrap()
    }

    const TWO_PASSAGES: &str = r#"
servers:
  web:
    user: root
    address: 10.0.0.1:22
    retries: 1
    passages:
      db: "5432"
      cache: "6379"
"#;

    async fn passages(manager: &PassageManager) -> (Arc<Passage>, Arc<Passage>) {
        (
            manager.passage("db").await.unwrap(),
            manager.passage("cache").await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_load_starts_passages() {
        let (connector, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();

        assert_eq!(manager.passage_names().await, vec!["cache", "db"]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(manager.connection("web").await.is_some());
        assert!(manager.addr("db").await.unwrap().starts_with("127.0.0.1:"));

        let status = manager.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].name, "db");
        assert_eq!(status[1].connection, "direct@localhost");
        assert_eq!(status[1].remote, "127.0.0.1:5432/tcp");

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_reload() {
        let (connector, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;
        let connection = manager.connection("web").await.unwrap();

        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db2, cache2) = passages(&manager).await;

        assert!(Arc::ptr_eq(&db, &db2));
        assert!(Arc::ptr_eq(&cache, &cache2));
        assert!(Arc::ptr_eq(&connection, &manager.connection("web").await.unwrap()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_change_isolation() {
        let (_, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;

        manager
            .load(config(&TWO_PASSAGES.replace("\"5432\"", "\"5433\"")))
            .await
            .unwrap();
        let (db2, cache2) = passages(&manager).await;

        assert!(!Arc::ptr_eq(&db, &db2));
        assert!(!db.is_running());
        assert_eq!(db2.remote().to_string(), "127.0.0.1:5433/tcp");
        assert!(Arc::ptr_eq(&cache, &cache2));
        assert!(Arc::ptr_eq(db.connection(), db2.connection()));

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_type_change_restarts_only_that_passage() {
        let (connector, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;

        let container = TWO_PASSAGES.replace(
            "      cache: \"6379\"\n",
            "      cache:\n        remote:\n          type: container\n          container: redis\n          port: 6379\n",
        );
        manager.load(config(&container)).await.unwrap();
        let (db2, cache2) = passages(&manager).await;

        assert!(!Arc::ptr_eq(&cache, &cache2));
        assert!(!cache.is_running());
        assert!(matches!(cache2.remote(), Remote::Container(_)));
        assert_eq!(cache2.remote().to_string(), "<container=redis>:6379/tcp");
        assert!(Arc::ptr_eq(&db, &db2));
        assert!(db.is_running());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_change_rebuilds_only_its_server() {
        let (connector, manager) = manager();
        let two_servers = |api_user: &str| {
            format!(
                "{TWO_PASSAGES}  api:\n    user: {api_user}\n    address: 10.0.0.2\n    passages:\n      api: \"8080\"\n"
            )
        };
        manager.load(config(&two_servers("root"))).await.unwrap();
        let (db, cache) = passages(&manager).await;
        let api = manager.passage("api").await.unwrap();
        let web_connection = manager.connection("web").await.unwrap();
        let api_connection = manager.connection("api").await.unwrap();

        manager.load(config(&two_servers("deploy"))).await.unwrap();
        let (db2, cache2) = passages(&manager).await;
        let api2 = manager.passage("api").await.unwrap();

        assert!(Arc::ptr_eq(&db, &db2));
        assert!(Arc::ptr_eq(&cache, &cache2));
        assert!(Arc::ptr_eq(&web_connection, &manager.connection("web").await.unwrap()));
        assert!(!Arc::ptr_eq(&api_connection, &manager.connection("api").await.unwrap()));
        assert!(!Arc::ptr_eq(&api, &api2));
        assert!(!api.is_running());
        assert!(api2.is_running());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_change_cascades() {
        let (connector, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;
        let connection = manager.connection("web").await.unwrap();

        manager
            .load(config(&TWO_PASSAGES.replace("retries: 1", "retries: 2")))
            .await
            .unwrap();
        let (db2, cache2) = passages(&manager).await;

        assert!(!Arc::ptr_eq(&db, &db2));
        assert!(!Arc::ptr_eq(&cache, &cache2));
        assert!(!Arc::ptr_eq(&connection, &manager.connection("web").await.unwrap()));
        assert!(Arc::ptr_eq(db2.connection(), cache2.connection()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_frees_port() {
        let (_, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, _) = passages(&manager).await;
        let addr = manager.addr("db").await.unwrap();

        manager
            .load(config(&TWO_PASSAGES.replace("      db: \"5432\"\n", "")))
            .await
            .unwrap();

        assert!(manager.passage("db").await.is_none());
        assert!(!db.is_running());
        assert!(matches!(
            manager.addr("db").await,
            Err(PassageError::NoSuchPassage(_))
        ));
        assert!(TcpListener::bind(&addr).await.is_ok());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_ends_open_tunnels() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        let yaml = TWO_PASSAGES.replace("\"5432\"", &format!("\"{echo_port}\""));

        let (_, manager) = manager();
        manager.load(config(&yaml)).await.unwrap();
        let (db, _) = passages(&manager).await;

        let mut client = TcpStream::connect(manager.addr("db").await.unwrap())
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(db.connections(), 1);

        manager
            .load(config(&yaml.replace(&format!("      db: \"{echo_port}\"\n"), "")))
            .await
            .unwrap();
        assert!(manager.passage("db").await.is_none());
        assert_eq!(db.connections(), 0);

        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await;
        assert!(read.is_err() || rest.is_empty());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_server_drops_connection() {
        let (_, manager) = manager();
        let two_servers = format!(
            "{TWO_PASSAGES}  api:\n    user: root\n    address: 10.0.0.2\n    passages:\n      api: \"8080\"\n"
        );
        manager.load(config(&two_servers)).await.unwrap();
        assert!(manager.connection("api").await.is_some());

        manager.load(config(TWO_PASSAGES)).await.unwrap();
        assert!(manager.connection("api").await.is_none());
        assert!(manager.passage("api").await.is_none());
        assert!(manager.connection("web").await.is_some());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_state_untouched() {
        let (_, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;

        let err = manager
            .load(config(&TWO_PASSAGES.replace("\"6379\"", "\"volume=x:1\"")))
            .await
            .unwrap_err();
        assert!(matches!(err, PassageError::InvalidConfig(_)));

        let err = manager.load(Config::default()).await.unwrap_err();
        assert!(err.to_string().contains("invalid empty config"));

        let (db2, cache2) = passages(&manager).await;
        assert!(Arc::ptr_eq(&db, &db2));
        assert!(Arc::ptr_eq(&cache, &cache2));
        assert!(db.is_running());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_is_collected_and_retried() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_addr = taken.local_addr().unwrap().to_string();
        let yaml = format!(
            r#"
servers:
  web:
    user: root
    address: 10.0.0.1
    passages:
      db: "5432"
      busy:
        remote: "6379"
        local: "{taken_addr}"
"#
        );

        let (_, manager) = manager();
        let err = manager.load(config(&yaml)).await.unwrap_err();
        let PassageError::Load(failures) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(failures.len(), 1);
        assert!(err.to_string().contains("passage \"busy\""));
        assert!(manager.passage("db").await.is_some());
        assert!(manager.passage("busy").await.is_none());

        drop(taken);
        manager.load(config(&yaml)).await.unwrap();
        assert_eq!(manager.addr("busy").await.unwrap(), taken_addr);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close() {
        let (_, manager) = manager();
        manager.load(config(TWO_PASSAGES)).await.unwrap();
        let (db, cache) = passages(&manager).await;

        manager.close().await.unwrap();
        assert!(!db.is_running());
        assert!(!cache.is_running());
        assert!(manager.passage_names().await.is_empty());
        assert!(manager.connection("web").await.is_none());

        manager.load(config(TWO_PASSAGES)).await.unwrap();
        assert_eq!(manager.passage_names().await.len(), 2);
        manager.close().await.unwrap();
    }
}
