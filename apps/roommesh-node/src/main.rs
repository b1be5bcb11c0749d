//! Room Mesh Node (`roommesh-node`)
//!
//! Host binary for the room mesh sync engine. Runs an in-process room of one
//! master and N clients over loopback TCP, with the in-memory session broker
//! standing in for the matchmaking service.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use roommesh_sync::{
    LocalSession, MemoryBundleSink, NodeBuilder, NodeEvent, NodeHandle, NodeObserver, Platform,
    Role, SyncConfig, MAX_PORT_OFFSET,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type AppResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "roommesh-node", version, about = "Room mesh sync host")]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a master and N clients in this process and sync a mesh between them
    Demo {
        /// Number of clients to join
        #[arg(long, default_value_t = 2)]
        clients: usize,

        /// Mesh file the master publishes (a generated mesh otherwise)
        #[arg(long)]
        mesh: Option<PathBuf>,

        /// Bundle root served by the master
        #[arg(long)]
        bundles: Option<PathBuf>,
    },

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Demo {
            clients,
            mesh,
            bundles,
        } => {
            let mut config = SyncConfig::load(args.config)?;
            if let Some(root) = bundles {
                config.bundles.root_dir = root;
            }
            run_demo(config, clients, mesh).await
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let config = SyncConfig::load_or_default(args.config);
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                let path = args
                    .config
                    .or_else(SyncConfig::default_config_path)
                    .ok_or("no config directory available, pass --config")?;
                if path.exists() && !force {
                    return Err(format!("{} already exists (use --force)", path.display()).into());
                }
                SyncConfig::default().save(Some(path.clone()))?;
                println!("Wrote {}", path.display());
                Ok(())
            }
        },
    }
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// =============================================================================
// Demo
// =============================================================================

/// Logs every node event, standing in for the renderer and UI.
struct LogObserver {
    node: String,
}

impl NodeObserver for LogObserver {
    fn on_event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::TransferFailed { kind, error } => {
                warn!(node = %self.node, kind = %kind, error = %error, "Transfer failed")
            }
            other => info!(node = %self.node, event = ?other, "Node event"),
        }
    }
}

struct DemoNode {
    name: String,
    handle: NodeHandle,
}

fn start_node(
    session: &LocalSession,
    mut config: SyncConfig,
    name: String,
    role: Role,
    platform: Platform,
    base_port: u16,
) -> AppResult<(DemoNode, roommesh_sync::LocalEndpoint)> {
    config.node.name = name.clone();
    config.node.role = role;
    config.node.platform = platform;
    config.transfer.base_port = base_port;
    config.transfer.bind_addr = "127.0.0.1".to_string();
    config.transfer.advertise_host = Some("127.0.0.1".to_string());

    let endpoint = session.endpoint();
    let handle = NodeBuilder::new(config)
        .with_observer(Arc::new(LogObserver { node: name.clone() }))
        .with_bundle_sink(Arc::new(MemoryBundleSink::new()))
        .start(Arc::new(endpoint.clone()))?;
    endpoint.attach(Arc::new(handle.clone()));
    Ok((DemoNode { name, handle }, endpoint))
}

async fn run_demo(config: SyncConfig, clients: usize, mesh: Option<PathBuf>) -> AppResult<()> {
    let room = config.room_name().to_string();
    let base = config.transfer.base_port;
    let stride = MAX_PORT_OFFSET + 1;
    let session = LocalSession::new();

    // Every node shares one host here, so each gets its own port block.
    let (master, master_endpoint) = start_node(
        &session,
        config.clone(),
        "master".to_string(),
        Role::Master,
        Platform::Desktop,
        base,
    )?;
    master_endpoint.create_room(&room);

    let mut members = Vec::with_capacity(clients);
    for i in 0..clients {
        let offset = u16::try_from(i + 1)
            .ok()
            .and_then(|n| n.checked_mul(stride))
            .and_then(|n| base.checked_add(n))
            .ok_or("too many clients for the configured base_port")?;
        let platform = Platform::ALL[i % Platform::ALL.len()];
        let (client, endpoint) = start_node(
            &session,
            config.clone(),
            format!("client-{}", i + 1),
            Role::Client,
            platform,
            offset,
        )?;
        endpoint.join(&room);
        members.push(client);
    }

    wait_until("clients joined", || {
        session.members(&room).map_or(0, |m| m.len()) == clients + 1
    })
    .await?;

    let scan = match mesh {
        Some(path) => Bytes::from(tokio::fs::read(&path).await?),
        None => generated_mesh(64 * 1024),
    };
    info!(bytes = scan.len(), "Master publishing mesh");
    master.handle.publish_replace(scan.clone())?;
    wait_until("mesh on every client", || {
        members.iter().all(|c| c.handle.store().len() == scan.len())
    })
    .await?;

    if let Some(first) = members.first() {
        let addition = generated_mesh(4 * 1024);
        let expected = scan.len() + addition.len();
        info!(node = %first.name, bytes = addition.len(), "Client pushing incremental add");
        first.handle.push_incremental(Some(addition))?;
        wait_until("merged mesh everywhere", || {
            master.handle.store().len() == expected
                && members.iter().all(|c| c.handle.store().len() == expected)
        })
        .await?;
    }

    print_status(&master, &members).await;

    match members.first() {
        Some(first) => first.handle.delete_mesh()?,
        None => master.handle.delete_mesh()?,
    }
    wait_until("room cleared", || {
        master.handle.store().is_empty() && members.iter().all(|c| c.handle.store().is_empty())
    })
    .await?;

    print_status(&master, &members).await;

    master.handle.shutdown();
    for client in &members {
        client.handle.shutdown();
    }
    info!("Demo complete");
    Ok(())
}

async fn print_status(master: &DemoNode, clients: &[DemoNode]) {
    for node in std::iter::once(master).chain(clients.iter()) {
        let status = node.handle.status().await;
        println!(
            "{:<10} {:<7} {:<17} bytes={:<8} v{:<3} ok={} failed={}",
            node.name,
            status.role,
            status.state,
            status.store_len,
            status.version,
            status.transfers_ok,
            status.transfers_failed,
        );
    }
}

/// Deterministic placeholder bytes standing in for a captured mesh.
fn generated_mesh(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

async fn wait_until(what: &str, check: impl Fn() -> bool) -> AppResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(format!("timed out waiting for {}", what).into())
}
