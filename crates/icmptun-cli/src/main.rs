//! icmptun command-line interface.

mod config;
mod pipe;

use clap::{Parser, Subcommand};
use config::Config;
use icmptun_core::{ClientSession, PacketConn, ServerSession};
use pipe::Pipe;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// icmptun - IP-over-ICMP tunnel
#[derive(Parser)]
#[command(name = "icmptun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a tunnel server
    Client {
        /// Local IPv4 address to send from
        #[arg(short, long)]
        local: Option<Ipv4Addr>,

        /// Server IPv4 address
        #[arg(short, long)]
        remote: Option<Ipv4Addr>,

        /// Session token (random when omitted)
        #[arg(short, long)]
        identify: Option<u16>,

        /// Lower bound on requests kept in the air
        #[arg(long)]
        min_air_seq: Option<u32>,

        /// Upper bound on requests kept in the air
        #[arg(long)]
        max_air_seq: Option<u32>,

        /// Local endpoint: `test` or `udp:<addr:port>`
        #[arg(short, long, default_value = "test")]
        pipe: Pipe,
    },

    /// Wait for a tunnel client
    Server {
        /// Local IPv4 address to listen on
        #[arg(short, long)]
        local: Option<Ipv4Addr>,

        /// Accept only this client (`0.0.0.0` accepts the first one)
        #[arg(short, long)]
        remote: Option<Ipv4Addr>,

        /// Sequence pool capacity (power of two)
        #[arg(short, long)]
        seq_pool_size: Option<usize>,

        /// Local endpoint: `test` or `udp:<addr:port>`
        #[arg(short, long, default_value = "test")]
        pipe: Pipe,
    },

    /// Write the default configuration file
    InitConfig {
        /// Output path (defaults to the user configuration directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Client {
            local,
            remote,
            identify,
            min_air_seq,
            max_air_seq,
            pipe,
        } => {
            let section = &mut config.client;
            if let Some(local) = local {
                section.local = local.to_string();
            }
            if let Some(remote) = remote {
                section.remote = Some(remote.to_string());
            }
            section.identify = identify.or(section.identify);
            section.min_air_seq = min_air_seq.or(section.min_air_seq);
            section.max_air_seq = max_air_seq.or(section.max_air_seq);

            config.validate_client()?;
            run_client(&config, pipe).await?;
        }
        Commands::Server {
            local,
            remote,
            seq_pool_size,
            pipe,
        } => {
            let section = &mut config.server;
            if let Some(local) = local {
                section.local = local.to_string();
            }
            if let Some(remote) = remote {
                section.remote = remote.to_string();
            }
            if let Some(size) = seq_pool_size {
                section.seq_pool_size = size;
            }

            config.validate_server()?;
            run_server(&config, pipe).await?;
        }
        Commands::InitConfig { output, force } => {
            let path = output.unwrap_or_else(Config::default_path);
            config.save_new(&path, force)?;
            println!("Wrote configuration to {}", path.display());
        }
    }

    Ok(())
}

async fn run_client(config: &Config, pipe: Pipe) -> anyhow::Result<()> {
    let local = config.client.local_addr()?;
    let remote = config.client.remote_addr()?;

    let session = ClientSession::dial(local, remote, config.client.session_config())?;
    tracing::info!(
        "Tunnel to {} open as session {:#06x}, pipe {}",
        remote,
        session.identify(),
        pipe
    );

    serve(Arc::new(session), pipe).await
}

async fn run_server(config: &Config, pipe: Pipe) -> anyhow::Result<()> {
    let local = config.server.local_addr()?;
    let remote = config.server.remote_addr()?;

    let session = ServerSession::listen(local, remote, config.server.session_config())?;
    tracing::info!("Listening on {}, pipe {}", local, pipe);

    serve(Arc::new(session), pipe).await
}

/// Run the pipe until it finishes or Ctrl+C, then close the session
async fn serve(session: Arc<dyn PacketConn>, pipe: Pipe) -> anyhow::Result<()> {
    let result = tokio::select! {
        result = pipe.run(session.clone()) => result,
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            signal.map_err(Into::into)
        }
    };

    session.close().await;

    let stats = session.stats();
    tracing::info!(
        "Session closed: {} sent ({} keepalives), {} received, {} delivered, {} discarded",
        stats.datagrams_sent,
        stats.keepalives_sent,
        stats.datagrams_received,
        stats.payloads_delivered,
        stats.discarded
    );

    result
}
