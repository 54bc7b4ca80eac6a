use clap::{Args, Parser};
use resbench::backend::{AddressBuilder, Backend, DatBackend, IpfsBackend, MultiaddrBuilder, PassThroughBuilder};
use resbench::config::{BackendKind, BenchConfig, Overrides};
use resbench::monitor::Monitor;
use resbench::network::{resolve, ProtocolEngine, ProxyConfig};
use resbench::session::{ClientSession, ResourceSession, ResourceSettings, ServerSession, Session, SessionState};
use resbench::stun;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "resbench")]
#[command(about = "Benchmark peer-to-peer resource distribution backends", long_about = None)]
struct Cli {
    /// Logical name of this node
    name: String,

    /// Address to listen on (server), connect to (client) or of the proxy (proxy modes)
    address: String,

    #[command(flatten)]
    mode: ModeArgs,

    #[command(flatten)]
    backend: BackendArgs,

    /// Output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log directory
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// Number of rounds to run (client only)
    #[arg(short, long)]
    tasks: Option<u32>,

    /// Generated file size [MB]
    #[arg(long)]
    size: Option<usize>,

    /// Seconds without progress before a client gives up (0 disables)
    #[arg(long)]
    timeout: Option<u64>,

    /// Connect backends directly once the peer's address is known
    #[arg(long)]
    connect: bool,

    /// Backend address to connect at start-up (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Report NAT type and external address via STUN before the session
    #[arg(long)]
    stun_test: bool,

    /// Configuration file (defaults to resbench.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ModeArgs {
    /// Work in client mode
    #[arg(short, long)]
    client: bool,

    /// Work in client mode through the proxy at ADDRESS, talking to PEER
    #[arg(long, value_name = "PEER")]
    proxy_client: Option<String>,

    /// Work in server mode
    #[arg(short, long)]
    server: bool,

    /// Work in server mode through the proxy at ADDRESS
    #[arg(long)]
    proxy_server: bool,
}

#[derive(Args)]
#[group(required = false, multiple = false)]
struct BackendArgs {
    /// Benchmark IPFS
    #[arg(long)]
    ipfs: bool,

    /// Benchmark Dat
    #[arg(long)]
    dat: bool,
}

impl BackendArgs {
    fn kind(&self) -> Option<BackendKind> {
        match (self.ipfs, self.dat) {
            (true, _) => Some(BackendKind::Ipfs),
            (_, true) => Some(BackendKind::Dat),
            _ => None,
        }
    }
}

fn create_backend(config: &BenchConfig) -> Result<(Arc<dyn Backend>, Arc<dyn AddressBuilder>), String> {
    match config.backend.kind {
        Some(BackendKind::Ipfs) => {
            let backend = IpfsBackend::new(config.backend.ipfs_program.clone())
                .with_warm_up(Duration::from_secs(config.backend.daemon_warm_up_secs));
            Ok((Arc::new(backend), Arc::new(MultiaddrBuilder)))
        }
        Some(BackendKind::Dat) => Ok((
            Arc::new(DatBackend::new(config.backend.dat_program.clone(), Vec::new())),
            Arc::new(PassThroughBuilder),
        )),
        None => Err("Please specify the IPFS or Dat flag".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let overrides = Overrides {
        output_dir: cli.output_dir,
        log_dir: cli.log_dir,
        tasks: cli.tasks,
        file_size_mb: cli.size,
        timeout_secs: cli.timeout,
        connect: cli.connect,
        peers: cli.peers,
        stun_test: cli.stun_test,
        backend: cli.backend.kind(),
    };
    let config = BenchConfig::load_with_overrides(cli.config, overrides)?;
    let (backend, builder) = create_backend(&config)?;

    let address = resolve(&cli.address).await?;
    let is_client = cli.mode.client || cli.mode.proxy_client.is_some();
    let proxy = if let Some(peer) = cli.mode.proxy_client {
        Some(ProxyConfig {
            address,
            peer: Some(peer),
        })
    } else if cli.mode.proxy_server {
        Some(ProxyConfig { address, peer: None })
    } else {
        None
    };

    let state = Arc::new(SessionState::new(config.session.timeout()));
    let settings = ResourceSettings {
        output_dir: config.session.output_dir.clone(),
        log_dir: config.session.log_dir.clone(),
        file_size: config.session.file_size_bytes(),
        peers: config.session.peers.clone(),
        direct_connections: config.session.connect,
    };
    let engine = Arc::new(ProtocolEngine::new(cli.name.clone(), address, proxy));

    let session: Arc<dyn Session> = if is_client {
        let resources = ResourceSession::new(backend, builder, state, settings, "client");
        Arc::new(ClientSession::new(engine, resources, config.session.tasks))
    } else {
        let resources = ResourceSession::new(backend, builder, state, settings, "server");
        Arc::new(ServerSession::new(engine, resources, config.session.resources_per_round))
    };

    info!(
        "Starting {} as {} on {}",
        cli.name,
        if is_client { "client" } else { "server" },
        address
    );
    if config.session.stun_test {
        stun::log_test(&config.session.stun_servers).await;
    }
    let outcome = Monitor::new(session).run().await;
    info!("Finished: {}", outcome);
    Ok(())
}
