use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, trace};

use feclink::codec::backend_by_name;
use feclink::config::Config;
use feclink::pipeline::receiver::ReceiverPipeline;
use feclink::pipeline::sender::SenderPipeline;
use feclink::telemetry;
use feclink::transport::{UdpLowerTransport, UdpUpperProtocol};
use feclink::{Error, Result};

/// Socket poll granularity; bounds how quickly workers notice shutdown.
const IO_POLL: Duration = Duration::from_millis(50);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Path to a TOML configuration file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the sending side of the adapter
    Tx {
        /// Peer address coded packets are sent to
        #[clap(required = true)]
        peer: String,

        /// Local address upper-protocol segments arrive on
        #[clap(long, default_value = "127.0.0.1:4550")]
        upper: String,

        /// Local bind address for the coded channel
        #[clap(long, default_value = "0.0.0.0:4556")]
        bind: String,
    },
    /// Runs the receiving side of the adapter
    Rx {
        /// Address recovered segments are delivered to
        #[clap(required = true)]
        upper: String,

        /// Local bind address for the coded channel
        #[clap(long, default_value = "0.0.0.0:4556")]
        bind: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match &cli.command {
        Commands::Tx { peer, upper, bind } => run_tx(config, peer, upper, bind),
        Commands::Rx { upper, bind } => run_rx(config, upper, bind),
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve '{addr}'")))
}

fn run_tx(config: Config, peer: &str, upper: &str, bind: &str) -> Result<()> {
    let backend = backend_by_name(&config.codec)?;
    let upper = UdpUpperProtocol::bind(resolve(upper)?, None, IO_POLL)?;
    let lower = UdpLowerTransport::bind(resolve(bind)?, Some(resolve(peer)?), IO_POLL)?;
    info!("tx adapter: peer {}, codec {}", peer, config.codec);

    let pipeline = SenderPipeline::start(config, backend, Arc::new(upper), Arc::new(lower))?;
    loop {
        thread::sleep(STATS_INTERVAL);
        trace!(
            "{} matrices in flight, success rate {:.3}\n{}",
            pipeline.in_flight(),
            pipeline.success_rate(),
            telemetry::render()
        );
    }
}

fn run_rx(config: Config, upper: &str, bind: &str) -> Result<()> {
    let backend = backend_by_name(&config.codec)?;
    let upper_dest = resolve(upper)?;
    let upper = UdpUpperProtocol::bind(([0, 0, 0, 0], 0).into(), Some(upper_dest), IO_POLL)?;
    let lower = UdpLowerTransport::bind(resolve(bind)?, None, IO_POLL)?;
    info!("rx adapter: delivering to {}, codec {}", upper_dest, config.codec);

    let pipeline = ReceiverPipeline::start(config, backend, Arc::new(upper), Arc::new(lower))?;
    loop {
        thread::sleep(STATS_INTERVAL);
        trace!(
            "{} matrices in flight\n{}",
            pipeline.in_flight(),
            telemetry::render()
        );
    }
}
