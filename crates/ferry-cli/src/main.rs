//! Ferry CLI
//!
//! Dial a peer, send one message and print the echoed replies; or run the
//! echo listener the dialer talks to.

mod config;

use clap::{Parser, Subcommand};
use ferry_core::app::Exchange;
use ferry_core::{Identity, Multiaddr, Node, ProtocolId};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Ferry - minimal peer-to-peer dialer
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial a peer, send one message and print every reply
    Dial {
        /// Peer address, e.g. /ip4/127.0.0.1/tcp/9999/ws/p2p/<peer id>
        #[arg(required = true)]
        addr: String,

        /// Message to send
        #[arg(short, long, default_value = "hey")]
        message: String,

        /// Application protocol (defaults to the configured one)
        #[arg(short, long)]
        protocol: Option<String>,
    },

    /// Listen for peers and echo the application protocol
    Listen {
        /// Listen address (defaults to the configured one)
        #[arg(short, long)]
        addr: Option<String>,

        /// Identity seed file (defaults to the configured one)
        #[arg(short, long)]
        key_file: Option<PathBuf>,
    },

    /// Measure round-trip time to a peer
    Ping {
        /// Peer address
        #[arg(required = true)]
        addr: String,

        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
    },

    /// Ask a peer to describe itself
    Identify {
        /// Peer address
        #[arg(required = true)]
        addr: String,
    },

    /// Generate a new identity
    Keygen {
        /// Output file for the seed (defaults to the configured key file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Output path (defaults to the standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::resolve(&config_path)?;
    config.validate()?;

    // Initialize logging: RUST_LOG, then -v, then the config file
    let fallback = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Dial {
            addr,
            message,
            protocol,
        } => dial(&addr, &message, protocol, &config).await,
        Commands::Listen { addr, key_file } => listen(addr, key_file, &config).await,
        Commands::Ping { addr, count } => ping(&addr, count, &config).await,
        Commands::Identify { addr } => identify(&addr, &config).await,
        Commands::Keygen { output } => keygen(output, &config),
        Commands::InitConfig { output } => init_config(output),
    }
}

fn parse_addr(addr: &str) -> anyhow::Result<Multiaddr> {
    addr.parse()
        .map_err(|e| anyhow::anyhow!("invalid address {}: {}", addr, e))
}

/// Dial `addr`, send `message` and print the replies as they arrive
async fn dial(
    addr: &str,
    message: &str,
    protocol: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let addr = parse_addr(addr)?;
    let protocol = match protocol {
        Some(id) => ProtocolId::new(id)?,
        None => config.app_protocol()?,
    };

    let node = Node::new(Identity::generate(), config.to_node_config()?)?;
    tracing::info!("Local peer id: {}", node.peer_id());
    tracing::info!("Dialing {} with {}", addr, protocol);

    let (conn, stream) = node.dial_protocol(&addr, &protocol).await?;
    let mut responses = Exchange::start(stream, message.as_bytes(), &node.config().exchange).await?;

    let mut received = 0;
    while let Some(payload) = responses.next().await {
        match payload {
            Ok(payload) => {
                received += 1;
                println!("{}", String::from_utf8_lossy(&payload));
            }
            Err(e) => {
                conn.close();
                anyhow::bail!("exchange failed after {} replies: {}", received, e);
            }
        }
    }

    tracing::info!("Stream closed by remote after {} replies", received);
    conn.close_and_wait().await;
    Ok(())
}

/// Run the echo listener until Ctrl+C
async fn listen(
    addr: Option<String>,
    key_file: Option<PathBuf>,
    config: &Config,
) -> anyhow::Result<()> {
    let addr = match addr {
        Some(addr) => parse_addr(&addr)?,
        None => config.listen_addr()?,
    };
    let identity = listener_identity(key_file.as_deref(), config)?;

    let node = Node::new(identity, config.to_node_config()?)?;
    let listener = node.listen(&addr).await?;
    println!("Listening on {}", listener.p2p_addr());

    tokio::select! {
        result = listener.serve() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
        }
    }
    Ok(())
}

/// Identity for the listener: the key file if present, otherwise a fresh
/// identity (its peer id changes on every start).
fn listener_identity(key_file: Option<&Path>, config: &Config) -> anyhow::Result<Identity> {
    match key_file {
        Some(path) => config::load_identity(path),
        None if config.node.key_file.exists() => config::load_identity(&config.node.key_file),
        None => {
            tracing::warn!(
                "No key file at {}, using a temporary identity (run `ferry keygen` to persist one)",
                config.node.key_file.display()
            );
            Ok(Identity::generate())
        }
    }
}

/// Ping `addr` and print each round trip
async fn ping(addr: &str, count: usize, config: &Config) -> anyhow::Result<()> {
    let addr = parse_addr(addr)?;
    let node = Node::new(Identity::generate(), config.to_node_config()?)?;

    let rtts = node.ping(&addr, count.max(1)).await?;
    for (seq, rtt) in rtts.iter().enumerate() {
        println!("ping {}: {:.3} ms", seq + 1, rtt.as_secs_f64() * 1000.0);
    }
    Ok(())
}

/// Print what the peer at `addr` reports about itself
async fn identify(addr: &str, config: &Config) -> anyhow::Result<()> {
    let addr = parse_addr(addr)?;
    let node = Node::new(Identity::generate(), config.to_node_config()?)?;

    let info = node.identify(&addr).await?;
    println!("Peer ID: {}", info.peer_id()?);
    println!("Agent: {}", info.agent_version);
    println!("Protocol version: {}", info.protocol_version);
    if let Some(observed) = &info.observed_addr {
        println!("Observed address: {observed}");
    }
    for listen in &info.listen_addrs {
        println!("Listening on: {listen}");
    }
    for protocol in &info.protocols {
        println!("Protocol: {protocol}");
    }
    Ok(())
}

/// Generate a new identity and save its seed
fn keygen(output: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.node.key_file.clone());
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", path.display());
    }

    let identity = Identity::generate();
    config::save_identity(&identity, &path)?;

    println!("Peer ID: {}", identity.peer_id());
    println!("Seed saved to: {}", path.display());
    Ok(())
}

/// Write the default configuration
fn init_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(Config::default_path);
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", path.display());
    }
    Config::default().save(&path)?;
    println!("Configuration written to: {}", path.display());
    Ok(())
}
