use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::bounded;
use std::net::SocketAddr;
use std::sync::Arc;

use seedbit::config::Config;
use seedbit::logging;
use seedbit::peer::node::PeerNode;
use seedbit::protocol::PeerAddr;
use seedbit::storage::FileStore;
use seedbit::tracker::server::Tracker;

#[derive(Parser, Debug)]
#[clap(about = "a tiny tracker-coordinated file swarm")]
struct Cli {
    #[clap(short, long, help = "path to a TOML config file")]
    config: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run the rendezvous tracker
    Tracker {
        #[clap(short, long, help = "address to listen on, host:port")]
        addr: String,
    },
    /// seed a file that is already in the local store
    Share {
        #[clap(short, long, help = "name of the file to seed")]
        file: String,
        #[clap(short, long, help = "tracker address, host:port")]
        tracker: String,
        #[clap(short, long, help = "address to listen on, host:port")]
        addr: String,
    },
    /// fetch a file from the swarm, then seed it
    Get {
        #[clap(short, long, help = "name of the file to fetch")]
        file: String,
        #[clap(short, long, help = "tracker address, host:port")]
        tracker: String,
        #[clap(short, long, help = "address to listen on, host:port")]
        addr: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    logging::setup(&config)?;

    match args.command {
        Command::Tracker { addr } => run_tracker(&addr, config),
        Command::Share {
            file,
            tracker,
            addr,
        } => run_peer(file, &tracker, &addr, config, true),
        Command::Get {
            file,
            tracker,
            addr,
        } => run_peer(file, &tracker, &addr, config, false),
    }
}

fn run_tracker(addr: &str, config: Config) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .context("tracker address should look like host:port")?;
    let tracker = Arc::new(Tracker::new(&config));
    tracker.spawn_console();

    // the sender lives for the whole run; the tracker stops with the process
    let (_stop, stop_rx) = bounded(1);
    tracker.run(addr, stop_rx)
}

fn run_peer(file: String, tracker: &str, addr: &str, config: Config, share: bool) -> Result<()> {
    let tracker = tracker
        .parse::<PeerAddr>()
        .context("tracker address should look like host:port")?
        .socket_addr()?;
    let addr: PeerAddr = addr
        .parse()
        .context("listen address should look like host:port")?;

    let node = if share {
        let store = FileStore::new(&config.db_dir);
        let content = store
            .load(&file)
            .with_context(|| format!("cannot seed {}: not in {}", file, config.db_dir))?;
        PeerNode::seeder(addr, tracker, file, content, config)
    } else {
        PeerNode::downloader(addr, tracker, file, config)
    };

    PeerNode::spawn_console(node.event_log());
    let (_stop, stop_rx) = bounded(1);
    node.run(stop_rx)
}
