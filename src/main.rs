use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use clap::Parser;
use error::Error;
use fortress::{Fortress, unix_now};
use keystore::KeyStore;
use registry::PeerId;
use server::{DEFAULT_ADDRESS, DEFAULT_KEEPALIVE, DEFAULT_MTU, ServerConfig};
use stats::{format_bytes, format_uptime};
use store::{Snapshot, Store};
use tracker::{DEFAULT_LIVENESS_WINDOW, Transition};
use wg::{Cidr, Endpoint, TunnelRuntime, cmd::WgCmdBackend, config::WgConfig, memory::MemoryRuntime};

pub(crate) mod error;
mod fortress;
mod keystore;
mod registry;
mod render;
mod server;
mod stats;
mod store;
mod tracker;
mod wg;

#[derive(Debug, clap::Parser)]
#[command(version, about = "WireGuard peer management and client config distribution")]
pub struct Args {
    /// State file holding the server config and the peer registry.
    #[arg(
        long,
        global = true,
        env = "FORTRESS_STATE",
        default_value = "/var/lib/wg-fortress/state.bin"
    )]
    state: PathBuf,

    #[arg(long, global = true, env = "FORTRESS_IFACE", default_value = "wg0")]
    iface: String,

    /// `memory` keeps the tunnel in-process and only touches the state file.
    #[arg(long, global = true, value_enum, default_value_t = RuntimeKind::Wg)]
    runtime: RuntimeKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RuntimeKind {
    Wg,
    Memory,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create the state file with a fresh server key.
    Init(InitArgs),

    #[command(flatten)]
    Admin(AdminCommand),
}

#[derive(Debug, clap::Args)]
struct InitArgs {
    /// Public `host:port` clients connect to.
    #[arg(long)]
    endpoint: Endpoint,

    #[arg(long, default_value_t = DEFAULT_ADDRESS)]
    address: Cidr,

    /// Defaults to the endpoint port.
    #[arg(long)]
    listen_port: Option<u16>,

    #[arg(long, value_delimiter = ',')]
    dns: Vec<IpAddr>,

    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,

    #[arg(long, default_value_t = DEFAULT_KEEPALIVE)]
    keepalive: u16,

    /// Seconds without a handshake before a peer counts as disconnected.
    #[arg(long, default_value_t = DEFAULT_LIVENESS_WINDOW.as_secs())]
    liveness_window: u64,

    /// Overwrite an existing state file, dropping its peers.
    #[arg(long)]
    force: bool,
}

/// Commands that operate on an initialized state file.
#[derive(Debug, clap::Subcommand)]
enum AdminCommand {
    /// Register a peer and print its private key once.
    AddPeer {
        name: String,

        /// Print the full client config including the private key.
        #[arg(long)]
        print_config: bool,
    },

    RemovePeer {
        id: PeerId,
    },

    ListPeers,

    /// Print a peer's client config with a private key placeholder.
    ShowConfig {
        id: PeerId,
    },

    Stats,

    /// Replace the server key pair. Every client needs a new config afterwards.
    RotateKey,

    /// Adopt the peers of an existing wg-quick config.
    Import {
        path: PathBuf,
    },

    /// Keep the runtime in sync and track sessions until interrupted.
    Run {
        /// Seconds between runtime polls.
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,

        /// Replaces the stored liveness window, in seconds.
        #[arg(long)]
        liveness_window: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Args {
        state,
        iface,
        runtime,
        command,
    } = Args::parse();
    let store = Store::new(state);

    let command = match command {
        Command::Init(init_args) => return init(&store, init_args),
        Command::Admin(command) => command,
    };

    let snapshot = store.load()?;

    match runtime {
        RuntimeKind::Wg => execute(command, store, snapshot, WgCmdBackend::new(iface)).await,
        RuntimeKind::Memory => {
            let runtime = MemoryRuntime::new(snapshot.server.listen_port);
            execute(command, store, snapshot, runtime).await
        }
    }
}

fn init(store: &Store, args: InitArgs) -> Result<(), Error> {
    if store.exists() && !args.force {
        return Err(Error::Conflict(format!(
            "{} already exists, pass --force to replace it",
            store.path().display()
        )));
    }

    let (_, private_key) = KeyStore::new().issue()?;
    let mut server = ServerConfig::new(private_key.reveal(), args.endpoint);
    server.address = args.address;
    server.listen_port = args.listen_port.unwrap_or(server.listen_port);
    if !args.dns.is_empty() {
        server.dns = args.dns;
    }
    server.mtu = args.mtu;
    server.persistent_keepalive = args.keepalive;
    server.liveness_window = args.liveness_window;

    server.validate()?;
    store.save(&Snapshot::new(server.clone(), Vec::new()))?;
    log::info!("initialized {}", store.path().display());
    println!("subnet:     {}", server.subnet());
    println!("endpoint:   {}", server.endpoint);
    println!("public key: {}", server.public_key());
    Ok(())
}

async fn execute<R>(
    command: AdminCommand,
    store: Store,
    snapshot: Snapshot,
    runtime: R,
) -> Result<(), Error>
where
    R: TunnelRuntime<Error = Error>,
{
    let fortress = Fortress::open(snapshot, store.clone(), runtime, KeyStore::new())?;

    match command {
        AdminCommand::AddPeer { name, print_config } => {
            let issued = fortress.add_peer(&name, unix_now()).await?;
            println!("id:          {}", issued.peer.id);
            println!("address:     {}", issued.peer.allowed_ip);
            println!("public key:  {}", issued.peer.public_key);

            if print_config {
                println!();
                print!("{}", fortress.render_issued(&issued).await?);
            } else {
                println!("private key: {}", issued.private_key.reveal());
            }
        }

        AdminCommand::RemovePeer { id } => {
            let peer = fortress.remove_peer(id).await?;
            println!("removed {} ({})", peer.name, peer.allowed_ip);
        }

        AdminCommand::ListPeers => {
            poll_once(&fortress).await;
            let now = unix_now();

            for status in fortress.list_peers(now).await {
                let handshake = status
                    .last_handshake
                    .map(|ts| format!("{} ago", format_uptime(Duration::from_secs(now.saturating_sub(ts)))))
                    .unwrap_or_else(|| "never".into());

                println!(
                    "{}  {:<20} {:<18} {:<12} {:<12} rx {} / tx {}",
                    status.peer.id,
                    status.peer.name,
                    status.peer.allowed_ip.to_string(),
                    status.state.to_string(),
                    handshake,
                    format_bytes(status.rx_bytes),
                    format_bytes(status.tx_bytes),
                );
            }
        }

        AdminCommand::ShowConfig { id } => print!("{}", fortress.render(id).await?),

        AdminCommand::Stats => {
            poll_once(&fortress).await;
            println!("{}", fortress.stats(unix_now()).await);
        }

        AdminCommand::RotateKey => {
            let public = fortress.rotate_server_key().await?;
            println!("new public key: {public}");
        }

        AdminCommand::Import { path } => import(&fortress, &path).await?,

        AdminCommand::Run {
            poll_interval,
            liveness_window,
        } => {
            let poll_interval = Duration::from_secs(poll_interval.max(1));
            run(&fortress, &store, poll_interval, liveness_window.map(Duration::from_secs)).await?
        }
    }

    Ok(())
}

async fn poll_once<R>(fortress: &Fortress<R>)
where
    R: TunnelRuntime<Error = Error>,
{
    if let Err(err) = fortress.poll_runtime(unix_now()).await {
        log::warn!("runtime unavailable, session data is empty: {err}");
    }
}

async fn import<R>(fortress: &Fortress<R>, path: &Path) -> Result<(), Error>
where
    R: TunnelRuntime<Error = Error>,
{
    let config = WgConfig::parse_config(&fs::read_to_string(path)?)?;
    let mut adopted = 0;

    for (idx, peer) in config.peers.iter().enumerate() {
        let name = peer
            .name
            .clone()
            .unwrap_or_else(|| format!("imported-{}", idx + 1));
        let requested = peer
            .allowed_ips
            .iter()
            .flatten()
            .find(|cidr| cidr.is_host())
            .map(|cidr| cidr.ip);

        match fortress
            .adopt_peer(&name, peer.public_key, requested, unix_now())
            .await
        {
            Ok(peer) => {
                adopted += 1;
                println!("{}  {:<20} {}", peer.id, peer.name, peer.allowed_ip);
            }
            Err(err) => log::warn!("skipping {name} ({}): {err}", peer.public_key),
        }
    }

    log::info!(
        "imported {adopted} of {} peers from {}",
        config.peers.len(),
        path.display()
    );
    Ok(())
}

fn modified_at(store: &Store) -> Option<SystemTime> {
    fs::metadata(store.path()).and_then(|m| m.modified()).ok()
}

async fn run<R>(
    fortress: &Fortress<R>,
    store: &Store,
    poll_interval: Duration,
    liveness_window: Option<Duration>,
) -> Result<(), Error>
where
    R: TunnelRuntime<Error = Error>,
{
    fortress.sync_runtime().await?;
    fortress.mark_started(unix_now(), liveness_window).await?;

    let server = fortress.server_config().await;
    log::info!(
        "serving {} on {} as {}",
        server.subnet(),
        server.endpoint,
        server.public_key()
    );

    let mut modified = modified_at(store);
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }

        let current = modified_at(store);
        if current != modified {
            modified = current;
            match store.load() {
                Ok(snapshot) => {
                    if let Err(err) = fortress.reload(snapshot).await {
                        log::error!("failed to apply {}: {err}", store.path().display());
                    }
                }
                Err(err) => log::error!("failed to read {}: {err}", store.path().display()),
            }
        }

        match fortress.poll_runtime(unix_now()).await {
            Ok(transitions) => {
                for transition in transitions {
                    match transition {
                        Transition::Connected(key) => {
                            log::info!("peer {} connected", fortress.describe(&key).await)
                        }
                        Transition::Disconnected(key) => {
                            log::info!("peer {} disconnected", fortress.describe(&key).await)
                        }
                    }
                }
            }
            Err(err) => log::warn!("runtime poll failed: {err}"),
        }
    }

    let stats = fortress.stats(unix_now()).await;
    log::info!(
        "exit after {}, {} of {} peers connected",
        format_uptime(stats.uptime),
        stats.active_connections,
        stats.total_peers
    );

    fortress.mark_stopped().await
}
