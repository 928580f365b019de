use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use clap::{Arg, ArgMatches, Command, value_parser};
use eyre::{Result, WrapErr, eyre};
use passage::{
    Config, PassageConfig, PassageManager, RemoteConfig, ServerConfig,
    config::DEFAULT_LOCAL,
    reload::{ConfigWatcher, DEFAULT_WATCH_INTERVAL, load_file},
    rpc::{DEFAULT_RPC_ADDR, RpcClient, RpcServer, format_dialable},
};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_FILE: &str = ".passage.yaml";

fn cli() -> Command {
    let log_level = Arg::new("log-level")
        .long("log-level")
        .value_name("LEVEL")
        .default_value("info")
        .help("Log level (trace, debug, info, warn, error)");
    let log_file = Arg::new("log-file")
        .long("log-file")
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .help("Also append logs to this file");
    let rpc_addr = Arg::new("rpc-addr")
        .long("rpc-addr")
        .value_name("PATH")
        .value_parser(value_parser!(PathBuf))
        .default_value(DEFAULT_RPC_ADDR)
        .help("Control socket path");

    Command::new("passage")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("SSH tunnel orchestrator")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("server")
                .about("Run every passage of a configuration file")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("Configuration file path (default: $HOME/.passage.yaml)"),
                )
                .arg(
                    Arg::new("watch-interval")
                        .long("watch-interval")
                        .value_name("SECS")
                        .value_parser(value_parser!(u64))
                        .default_value("2")
                        .help("Seconds between configuration file checks, 0 disables reloading"),
                )
                .arg(log_level.clone())
                .arg(log_file.clone())
                .arg(rpc_addr.clone()),
        )
        .subcommand(
            Command::new("get")
                .about("Print the local address of a running passage")
                .arg(Arg::new("name").required(true).help("Passage name"))
                .arg(rpc_addr),
        )
        .subcommand(
            Command::new("listen")
                .about("Forward a single remote target until interrupted")
                .arg(
                    Arg::new("server")
                        .required(true)
                        .help("SSH server address, host[:port]"),
                )
                .arg(
                    Arg::new("remote")
                        .required(true)
                        .help("Remote target, e.g. 5432, db:5432 or container=web:80"),
                )
                .arg(
                    Arg::new("user")
                        .short('u')
                        .long("user")
                        .value_name("USER")
                        .help("SSH user (default: current user)"),
                )
                .arg(
                    Arg::new("addr")
                        .short('a')
                        .long("addr")
                        .value_name("BIND")
                        .default_value(DEFAULT_LOCAL)
                        .help("Local bind address"),
                )
                .arg(
                    Arg::new("retries")
                        .long("retries")
                        .value_name("N")
                        .value_parser(value_parser!(u32))
                        .help("Dial retries after the first attempt"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECS")
                        .value_parser(value_parser!(u64))
                        .help("Dial timeout in seconds"),
                )
                .arg(
                    Arg::new("key")
                        .short('k')
                        .long("key")
                        .value_name("FILE")
                        .help("Private key file (default: ssh-agent)"),
                )
                .arg(log_level)
                .arg(log_file),
        )
}

fn init_logging(args: &ArgMatches) -> Result<()> {
    let level = args
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_file = args.get_one::<PathBuf>("log-file");
    passage::init_logging(level, log_file.map(PathBuf::as_path))
        .wrap_err("Failed to initialize logging")
}

async fn server(args: &ArgMatches) -> Result<()> {
    init_logging(args)?;

    let config_path = match args.get_one::<PathBuf>("config") {
        Some(path) => path.clone(),
        None => dirs::home_dir()
            .map(|home| home.join(DEFAULT_CONFIG_FILE))
            .ok_or_else(|| eyre!("Cannot locate the home directory, pass --config"))?,
    };
    let rpc_addr = args
        .get_one::<PathBuf>("rpc-addr")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RPC_ADDR));

    let manager = Arc::new(PassageManager::new());
    if let Err(e) = load_file(&manager, &config_path).await {
        if let Err(close) = manager.close().await {
            warn!("Error closing passages: {}", close);
        }
        return Err(e).wrap_err_with(|| {
            format!("Failed to load configuration from {}", config_path.display())
        });
    }
    info!("Loaded configuration from {}", config_path.display());
    for status in manager.status().await {
        info!(
            passage = %status.name,
            "({})-[{}]->({})",
            status.connection,
            status.remote,
            status.local
        );
    }

    let rpc = RpcServer::listen(Arc::clone(&manager), &rpc_addr)
        .await
        .wrap_err("Failed to start control service")?;

    let watch_interval = args
        .get_one::<u64>("watch-interval")
        .copied()
        .unwrap_or(DEFAULT_WATCH_INTERVAL.as_secs());
    let mut watcher = None;
    if watch_interval > 0 {
        let mut config_watcher = ConfigWatcher::new(
            &config_path,
            Arc::clone(&manager),
            Duration::from_secs(watch_interval),
        );
        let handle = config_watcher.start().await?;
        watcher = Some((config_watcher, handle));
    }

    info!("Passage server running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    if let Some((mut config_watcher, handle)) = watcher {
        config_watcher.stop().await;
        if let Err(e) = handle.await {
            error!("Config watcher join error: {}", e);
        }
    }
    if let Err(e) = rpc.close().await {
        warn!("Error closing control service: {}", e);
    }
    manager.close().await?;

    info!("Shutdown complete");
    Ok(())
}

async fn get(args: &ArgMatches) -> Result<()> {
    let name = args
        .get_one::<String>("name")
        .ok_or_else(|| eyre!("Missing passage name"))?;
    let rpc_addr = args
        .get_one::<PathBuf>("rpc-addr")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RPC_ADDR));

    let mut client = RpcClient::connect(&rpc_addr).await?;
    let addr = client.addr(name).await?;
    println!("{}", format_dialable(&addr));
    Ok(())
}

async fn listen(args: &ArgMatches) -> Result<()> {
    init_logging(args)?;

    let address = args
        .get_one::<String>("server")
        .ok_or_else(|| eyre!("Missing server address"))?;
    let remote = args
        .get_one::<String>("remote")
        .ok_or_else(|| eyre!("Missing remote target"))?;
    let local = args
        .get_one::<String>("addr")
        .map(String::as_str)
        .unwrap_or(DEFAULT_LOCAL);

    let server = ServerConfig {
        user: args.get_one::<String>("user").cloned().unwrap_or_default(),
        address: address.clone(),
        timeout: args.get_one::<u64>("timeout").copied(),
        retries: args.get_one::<u32>("retries").copied(),
        key: args.get_one::<String>("key").cloned(),
        passages: BTreeMap::from([(
            remote.clone(),
            PassageConfig::new(RemoteConfig::Literal(remote.clone()), local),
        )]),
    };
    let config = Config {
        servers: BTreeMap::from([(address.clone(), server)]),
    };

    let manager = PassageManager::new();
    manager.load(config).await?;
    for status in manager.status().await {
        info!("({})-[{}]->({})", status.connection, status.remote, status.local);
        println!("{}", status.local);
    }

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    manager.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("server", args)) => server(args).await,
        Some(("get", args)) => get(args).await,
        Some(("listen", args)) => listen(args).await,
        Some((other, _)) => Err(eyre!("Unknown command: {other}")),
        None => Err(eyre!("Missing command")),
    }
}
