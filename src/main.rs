//! loopwire - same-host IPC daemon and tooling
//!
//! Runs a server, pings one, or discovers the ones running on this host.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loopwire::config::{self, Config};
use loopwire::discovery::{DiscoveredServer, Discovery};
use loopwire::network::{
    supports_unix_sockets, Client, HandshakeOutcome, PacketHandler, Server, TransportKind,
};
use loopwire::protocol::{self, PacketType};

/// loopwire - same-host IPC over loopback TCP and Unix sockets
#[derive(Parser)]
#[command(name = "loopwire")]
#[command(author = "Loopwire Contributors")]
#[command(version = "0.1.0")]
#[command(
    about = "Lightweight same-host IPC over TCP loopback and Unix domain sockets",
    long_about = None
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Transport selection shared by `serve` and `ping`
#[derive(clap::Args, Debug, Clone)]
struct TransportArgs {
    /// TCP port (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use a Unix domain socket instead of TCP
    #[arg(short, long)]
    unix: bool,

    /// Unix socket path (implies --unix)
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

impl TransportArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if self.unix || self.socket.is_some() {
            config.network.transport = TransportKind::Unix;
        }
        if let Some(socket) = &self.socket {
            config.network.socket_path = Some(socket.clone());
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server until Ctrl+C
    Serve {
        #[command(flatten)]
        transport: TransportArgs,

        /// Platform identifier reported to discovery probes
        #[arg(long)]
        platform: Option<String>,
    },

    /// Connect, handshake and measure round trip times
    Ping {
        #[command(flatten)]
        transport: TransportArgs,

        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,

        /// Delay between pings (milliseconds)
        #[arg(short, long, default_value_t = 1000)]
        interval: u64,
    },

    /// Find servers running on this host
    Discover {
        /// First port of the scan range
        #[arg(long)]
        start: Option<u16>,

        /// Last port of the scan range
        #[arg(long)]
        end: Option<u16>,

        /// Scan the socket directory instead of TCP ports
        #[arg(short, long, conflicts_with = "all")]
        unix: bool,

        /// Scan TCP ports and the socket directory
        #[arg(short, long)]
        all: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            transport,
            platform,
        } => {
            transport.apply(&mut config);
            if let Some(platform) = platform {
                config.network.platform = platform;
            }
            run_server(config).await?;
        }
        Commands::Ping {
            transport,
            count,
            interval,
        } => {
            transport.apply(&mut config);
            run_ping(config, count, Duration::from_millis(interval)).await?;
        }
        Commands::Discover {
            start,
            end,
            unix,
            all,
            json,
        } => {
            if let Some(start) = start {
                config.discovery.port_start = start;
            }
            if let Some(end) = end {
                config.discovery.port_end = end;
            }
            run_discovery(config, unix, all, json).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Run a server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = Server::bind(config.network.clone(), &config.general.app_name).await?;

    server.handle(|packet, origin| {
        if !packet.packet_type().is_reserved() {
            tracing::info!("{} from {}", packet, origin.peer_addr());
        }
    });
    server.handle_type(PacketType::ConnectionKilled, |packet, origin| {
        tracing::debug!("{} from {}", packet, origin.peer_addr());
    });

    println!("\n========================================");
    println!("  loopwire server running");
    println!("========================================");
    println!("  Address:  {}", server.local_addr());
    println!("  Platform: {}", config.network.platform);
    println!("  Protocol: v{}", config.network.protocol_version);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Connect, handshake, then ping `count` times
async fn run_ping(config: Config, count: u32, interval: Duration) -> anyhow::Result<()> {
    let client = Client::connect(config.network.clone(), &config.general.app_name).await?;
    let peer = client.peer_addr().clone();

    if let HandshakeOutcome::Refused(reason) = client.handshake().await? {
        client.close().await;
        anyhow::bail!("Handshake refused by {}: {}", peer, reason);
    }
    println!("Connected to {}", peer);

    let mut received = 0;
    for seq in 0..count {
        if seq > 0 {
            tokio::time::sleep(interval).await;
        }
        match client.ping().await {
            Ok(rtt) => {
                received += 1;
                let millis = rtt.as_secs_f64() * 1000.0;
                println!("Reply from {}: seq={} time={:.3} ms", peer, seq, millis);
            }
            Err(e) => println!("No reply from {}: seq={} ({})", peer, seq, e),
        }
        if client.is_closed() {
            break;
        }
    }

    println!("\n{} pings sent, {} replies", count, received);
    if let Err(e) = client.cleanly_close(0).await {
        tracing::debug!("Clean close failed: {}", e);
    }

    Ok(())
}

/// Scan for servers and print what answered
async fn run_discovery(config: Config, unix: bool, all: bool, json: bool) -> anyhow::Result<()> {
    let discovery = Discovery::new(config.discovery);

    let found: Vec<DiscoveredServer> = if all {
        discovery.scan_all().await?
    } else if unix {
        discovery.scan_unix().await?
    } else {
        discovery.scan_tcp().await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("No servers found.");
    }
    for server in &found {
        println!("{}  {}", server.endpoint, server.platform);
    }

    Ok(())
}

/// Print protocol information
fn print_info(config: &Config) {
    println!("loopwire Protocol Information");
    println!("=============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Frame Size: {} bytes", config.network.max_frame_size);
    let unix = if supports_unix_sockets() { "supported" } else { "unsupported" };
    println!("Unix Sockets: {}", unix);
    println!("Socket Path: {}", config.socket_path().display());
}
