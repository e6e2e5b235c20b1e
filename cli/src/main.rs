use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lifenet::{
    broker::Broker,
    client::Client,
    cohort::{run_member, MemberConfig, ProcessSpawner, TaskSpawner},
    config::{
        BrokerConfig, OverflowPolicy, SessionSettings, TransportSettings, DEFAULT_BROKER_PORT,
        DEFAULT_MAX_CELLS,
    },
    life::Grid,
    net::SessionToken,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lifenet", version, about = "Game of Life across a spawned cohort")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept sessions and spawn a cohort for each.
    Broker(BrokerArgs),
    /// Run one cohort member. Started by the broker.
    #[command(hide = true)]
    Member(MemberArgs),
    /// Start a session, print snapshots and stop.
    Client(ClientArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// IP cohort members and clients bind their endpoints to.
    #[arg(long, env = "LIFENET_BIND_IP", default_value = "127.0.0.1")]
    bind_ip: IpAddr,
    /// IP put into contact addresses instead of the bound one.
    #[arg(long, env = "LIFENET_ADVERTISE_IP")]
    advertise_ip: Option<IpAddr>,
    /// Milliseconds between ticks; 0 free-runs.
    #[arg(long, env = "LIFENET_TICK_MS", default_value_t = 0)]
    tick_ms: u64,
    /// Largest grid, in cells, a manager accepts.
    #[arg(long, env = "LIFENET_MAX_CELLS", default_value_t = DEFAULT_MAX_CELLS)]
    max_cells: usize,
    #[arg(long, env = "LIFENET_KEEP_ALIVE_MS", default_value_t = 1000)]
    keep_alive_ms: u64,
    /// How long a finished side waits for its peer to hang up.
    #[arg(long, env = "LIFENET_LINGER_MS", default_value_t = 5000)]
    linger_ms: u64,
}

impl SessionArgs {
    fn settings(&self) -> SessionSettings {
        let transport = TransportSettings::builder()
            .keep_alive_interval(Duration::from_millis(self.keep_alive_ms))
            .linger(Duration::from_millis(self.linger_ms))
            .build();
        let mut settings = SessionSettings::builder()
            .bind_ip(self.bind_ip)
            .tick_interval(Duration::from_millis(self.tick_ms))
            .max_cells(self.max_cells)
            .transport(transport)
            .build();
        settings.advertise_ip = self.advertise_ip;
        settings
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Overflow {
    Queue,
    Reject,
}

impl From<Overflow> for OverflowPolicy {
    fn from(overflow: Overflow) -> Self {
        match overflow {
            Overflow::Queue => OverflowPolicy::Queue,
            Overflow::Reject => OverflowPolicy::Reject,
        }
    }
}

#[derive(Args)]
struct BrokerArgs {
    #[arg(long, env = "LIFENET_LISTEN", default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)))]
    listen: SocketAddr,
    #[arg(long, env = "LIFENET_MAX_PENDING", default_value_t = 5)]
    max_pending_sessions: usize,
    #[arg(long, value_enum, env = "LIFENET_OVERFLOW", default_value = "queue")]
    overflow: Overflow,
    #[arg(long, env = "LIFENET_MAX_WORKERS", default_value_t = 64)]
    max_workers: u32,
    #[arg(long, env = "LIFENET_SPAWN_TIMEOUT_MS", default_value_t = 30_000)]
    spawn_timeout_ms: u64,
    /// Run cohort members as tasks in this process instead of spawning
    /// processes.
    #[arg(long)]
    in_process: bool,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct MemberArgs {
    #[arg(long)]
    broker: SocketAddr,
    #[arg(long)]
    token: SessionToken,
    #[arg(long)]
    rank: u32,
    #[arg(long)]
    size: u32,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, env = "LIFENET_BROKER", default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)))]
    broker: SocketAddr,
    #[arg(long, short = 'n', default_value_t = 4)]
    workers: u32,
    /// Grid in the `height width cells...` format; read from stdin when
    /// neither this nor --random is given.
    grid: Option<PathBuf>,
    /// Generate a random HEIGHTxWIDTH grid instead of reading one.
    #[arg(long, value_name = "HEIGHTxWIDTH", conflicts_with = "grid")]
    random: Option<String>,
    #[arg(long, requires = "random")]
    seed: Option<u64>,
    /// Number of snapshots to print before stopping.
    #[arg(long, default_value_t = 1)]
    snapshots: u32,
    /// Pause between snapshots, in milliseconds.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
    #[command(flatten)]
    session: SessionArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Broker(args) => run_broker(args).await,
        Command::Member(args) => run_cohort_member(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let mut config = BrokerConfig::builder()
        .listen(args.listen)
        .max_pending_sessions(args.max_pending_sessions)
        .overflow(args.overflow.into())
        .max_workers(args.max_workers)
        .spawn_timeout(Duration::from_millis(args.spawn_timeout_ms))
        .session(args.session.settings())
        .build();
    config.advertise_ip = args.session.advertise_ip;

    let broker = if args.in_process {
        Broker::bind(config, TaskSpawner)?
    } else {
        Broker::bind(config, ProcessSpawner::current_exe()?)?
    };

    tokio::select! {
        served = broker.serve() => served?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            broker.shutdown().await;
        }
    }
    Ok(())
}

async fn run_cohort_member(args: MemberArgs) -> Result<()> {
    let config = MemberConfig::builder()
        .token(args.token)
        .rank(args.rank)
        .cohort_size(args.size)
        .broker(args.broker)
        .session(args.session.settings())
        .build();
    run_member(config)
        .await
        .with_context(|| format!("cohort member {} failed", args.rank))
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let grid = load_grid(&args).await?;
    let client = Client::bind(&args.session.settings())?;
    let mut session = client.start(args.broker, args.workers, &grid).await?;

    for n in 0..args.snapshots {
        if n > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
        let snapshot = session.snapshot().await?;
        println!("snapshot {n} ({} alive)", snapshot.alive());
        print!("{snapshot}");
    }

    if let Err(err) = session.stop().await {
        warn!(%err, "session did not stop cleanly");
    }
    client.shutdown().await;
    Ok(())
}

async fn load_grid(args: &ClientArgs) -> Result<Grid> {
    if let Some(size) = &args.random {
        let Some((height, width)) = size.split_once('x') else {
            bail!("--random expects HEIGHTxWIDTH, got `{size}`");
        };
        let height = height.parse().context("grid height")?;
        let width = width.parse().context("grid width")?;
        let mut rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        return Ok(Grid::random(height, width, 0.5, &mut rng)?);
    }

    let text = match &args.grid {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            text
        }
    };
    Ok(text.parse()?)
}
