use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lanreg_core::types::{Node, Service};
use lanreg_core::{AppConfig, LogFormat};
use lanreg_registry::{Registry, RegistryError, RegistryFactory, WatchOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// lanreg - local-network service registry over multicast
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, env = "LANREG_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Registry backend
    #[arg(long, default_value = "multicast")]
    backend: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print registry changes as they happen
    Watch {
        /// Only show changes for this service
        #[arg(short, long)]
        service: Option<String>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Announce a service until interrupted
    Announce {
        /// Service name
        #[arg(short, long)]
        name: String,

        /// Service version
        #[arg(short, long, default_value = "0.0.0")]
        version: String,

        /// Reachable address as host:port
        #[arg(short, long)]
        address: String,

        /// Node ID (defaults to <hostname>-<random>)
        #[arg(long)]
        node_id: Option<String>,

        /// Metadata entries as key=value
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Ask peers to announce, then print what is known
    List {
        /// How long to collect answers
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
    },
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_config_builder(path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?,
        None => AppConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let level = config.logging.parse_level()?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
    Ok(())
}

fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().replace('.', "-"))
        .unwrap_or_else(|_| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config)?;

    let factory = RegistryFactory::with_defaults();
    let registry = factory
        .create(&args.backend, config.registry.clone())
        .with_context(|| format!("Failed to create '{}' registry", args.backend))?;

    registry.start().await.context("Failed to start registry")?;
    info!(
        backend = registry.name(),
        group = %config.registry.group,
        port = config.registry.port,
        "Registry running"
    );

    let result = match args.command {
        Command::Watch { service, json } => run_watch(&registry, service, json).await,
        Command::Announce {
            name,
            version,
            address,
            node_id,
            metadata,
        } => {
            let mut node = Node::new(node_id.unwrap_or_else(default_node_id), address);
            node.metadata.extend(metadata);
            let service = Service::new(name, version).with_node(node);
            run_announce(&registry, service).await
        }
        Command::List { wait_ms } => run_list(&registry, Duration::from_millis(wait_ms)).await,
    };

    registry.stop().await.context("Failed to stop registry")?;
    result
}

async fn run_watch(registry: &Arc<dyn Registry>, service: Option<String>, json: bool) -> Result<()> {
    let options = WatchOptions { service };
    let watcher = registry.watch_with(options).await?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                watcher.stop();
                return Ok(());
            }
            next = watcher.next() => match next {
                Ok(event) if json => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => {
                    for node in &event.service.nodes {
                        println!(
                            "{} {} {}@{} {} {}",
                            event.timestamp.format("%H:%M:%S%.3f"),
                            event.action,
                            event.service.name,
                            event.service.version,
                            node.id,
                            node.address
                        );
                    }
                }
                Err(RegistryError::WatcherOverflow { dropped }) => {
                    warn!(dropped, "Watcher fell behind, resynchronizing");
                    for service in registry.list_services().await? {
                        println!("sync {}@{} ({} nodes)", service.name, service.version, service.nodes.len());
                    }
                }
                Err(RegistryError::WatcherStopped) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

async fn run_announce(registry: &Arc<dyn Registry>, service: Service) -> Result<()> {
    if let Err(e) = service.validate() {
        bail!("Invalid service: {}", e);
    }

    registry.register(&service).await.context("Failed to register")?;
    info!(service = %service.name, version = %service.version, "Announcing, press Ctrl-C to stop");

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    registry.deregister(&service).await.context("Failed to deregister")?;
    Ok(())
}

async fn run_list(registry: &Arc<dyn Registry>, wait: Duration) -> Result<()> {
    registry.query(None).await.context("Failed to send query")?;
    tokio::time::sleep(wait).await;

    for service in registry.list_services().await? {
        println!("{} {}", service.name, service.version);
        for node in &service.nodes {
            let mut metadata: Vec<_> = node.metadata.iter().collect();
            metadata.sort();
            let metadata: Vec<String> = metadata.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("  {} {} {}", node.id, node.address, metadata.join(","));
        }
    }
    Ok(())
}
