//! Run a ring peer from the command line.
//!
//! Starts (or joins) a ring and then reads commands from stdin:
//! `create <key> <value>`, `read <key>`, `upload <path>`,
//! `download <key> <path>`, `leave`, `quit`.

use clap::Parser;
use clap::ValueEnum;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use ringstore::dht::RingInspect;
use ringstore::node::ChordNode;
use ringstore::node::DhashNode;
use ringstore::node::PeerConfig;
use ringstore::Result;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Single-successor key/value store.
    Chord,
    /// Replicated erasure-coded store.
    Dhash,
}

#[derive(Parser, Debug)]
#[command(name = "ringstore", about = "Chord/DHash ring peer")]
struct Args {
    /// Address to bind the peer's listener to.
    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to bind the peer's listener to.
    #[arg(long)]
    port: u16,

    /// Gateway peer to join, as host:port. Without it a new ring starts.
    #[arg(long)]
    join: Option<String>,

    /// Which service to run.
    #[arg(long, value_enum, default_value_t = Mode::Chord)]
    mode: Mode,

    /// Successor list capacity.
    #[arg(long)]
    num_succs: Option<usize>,
}

enum Peer {
    Chord(ChordNode),
    Dhash(DhashNode),
}

impl Peer {
    async fn create(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Peer::Chord(node) => node.create(key, value).await,
            Peer::Dhash(node) => node.create(key, value).await,
        }
    }

    async fn read(&self, key: &str) -> Result<String> {
        match self {
            Peer::Chord(node) => node.read(key).await,
            Peer::Dhash(node) => node.read(key).await,
        }
    }

    async fn upload(&self, path: &str) -> Result<()> {
        match self {
            Peer::Chord(node) => node.upload_file(path).await,
            Peer::Dhash(node) => node.upload_file(path).await,
        }
    }

    async fn download(&self, key: &str, output: &str) -> Result<()> {
        match self {
            Peer::Chord(node) => node.download_file(key, output).await,
            Peer::Dhash(node) => node.download_file(key, output).await,
        }
    }

    async fn leave(&self) -> Result<()> {
        match self {
            Peer::Chord(node) => node.leave().await,
            Peer::Dhash(node) => node.leave().await,
        }
    }

    fn inspect(&self) -> RingInspect {
        match self {
            Peer::Chord(node) => RingInspect::inspect(node.state()),
            Peer::Dhash(node) => RingInspect::inspect(node.state()),
        }
    }

    async fn fail(&self) -> Result<()> {
        match self {
            Peer::Chord(node) => node.fail().await,
            Peer::Dhash(node) => node.fail().await,
        }
    }
}

fn parse_gateway(s: &str) -> Result<(String, u16)> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| {
        ringstore::Error::PeerParse(format!("expected host:port, got {:?}", s))
    })?;
    let port = port
        .parse()
        .map_err(|_| ringstore::Error::PeerParse(format!("invalid port in {:?}", s)))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = PeerConfig::default();
    if let Some(num_succs) = args.num_succs {
        config.num_succs = num_succs;
    }

    let peer = match args.mode {
        Mode::Chord => Peer::Chord(ChordNode::start(&args.addr, args.port, config).await?),
        Mode::Dhash => Peer::Dhash(DhashNode::start(&args.addr, args.port, config).await?),
    };

    match &args.join {
        Some(gateway) => {
            let (host, port) = parse_gateway(gateway)?;
            match &peer {
                Peer::Chord(node) => node.join(&host, port).await?,
                Peer::Dhash(node) => node.join(&host, port).await?,
            }
            println!("joined ring via {}", gateway);
        }
        None => {
            match &peer {
                Peer::Chord(node) => node.start_chord().await?,
                Peer::Dhash(node) => node.start_chord().await?,
            }
            println!("started a new ring on {}:{}", args.addr, args.port);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                peer.fail().await?;
                break;
            }
        };

        let line = match line {
            Some(line) => line,
            None => {
                peer.fail().await?;
                break;
            }
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        let outcome = match parts.as_slice() {
            ["create", key, value @ ..] if !value.is_empty() => {
                peer.create(key, &value.join(" ")).await.map(|_| None)
            }
            ["read", key] => peer.read(key).await.map(Some),
            ["upload", path] => peer.upload(path).await.map(|_| None),
            ["download", key, output] => peer.download(key, output).await.map(|_| None),
            ["info"] => {
                print!("{}", peer.inspect());
                continue;
            }
            ["leave"] => {
                peer.leave().await?;
                break;
            }
            ["quit"] | ["exit"] => {
                peer.fail().await?;
                break;
            }
            [] => continue,
            _ => {
                eprintln!(
                    "commands: create <key> <value> | read <key> | upload <path> | \
                     download <key> <path> | info | leave | quit"
                );
                continue;
            }
        };

        match outcome {
            Ok(Some(value)) => println!("{}", value),
            Ok(None) => println!("ok"),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    Ok(())
}
