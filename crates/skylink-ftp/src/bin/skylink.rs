//! Skylink CLI - serve a directory or talk to a vehicle over UDP
//!
//! Usage:
//!   skylink serve <root>                  Serve a directory
//!   skylink --peer <addr> ls [path]       List a remote directory
//!   skylink --peer <addr> get <remote>    Download a file
//!   skylink --peer <addr> put <local>     Upload a file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use skylink_core::{Config, EntryKind, FtpResult, ProvideResult};
use skylink_ftp::{FtpClient, FtpServer, ServerComponent, UdpTransport};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "skylink")]
#[command(about = "File transfer over a lossy datagram link", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local bind address
    #[arg(short, long, global = true)]
    bind: Option<SocketAddr>,

    /// Peer address
    #[arg(short, long, global = true, env = "SKYLINK_PEER")]
    peer: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory
    Serve {
        /// Root directory
        root: PathBuf,

        /// Extra files served by name regardless of the root
        #[arg(long)]
        provide: Vec<PathBuf>,
    },

    /// Upload a file
    Put {
        local: PathBuf,

        /// Remote directory
        #[arg(default_value = "/")]
        remote_dir: String,
    },

    /// Download a file
    Get {
        remote: String,

        /// Local directory
        #[arg(default_value = ".")]
        local_dir: PathBuf,
    },

    /// List a remote directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Remove a remote file
    Rm { path: String },

    /// Create a remote directory
    Mkdir { path: String },

    /// Remove an empty remote directory
    Rmdir { path: String },

    /// Rename a remote file or directory
    Mv { from: String, to: String },

    /// Print the CRC32 of a remote file
    Crc { path: String },

    /// Compare a local file with a remote one
    Cmp { local: PathBuf, remote: String },

    /// Drop every open session on the server
    Reset,

    /// Print a sample config file
    SampleConfig,
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(peer) = cli.peer {
        config.link.peer = Some(peer);
    }

    match cli.command {
        Commands::SampleConfig => {
            print!("{}", Config::sample());
            Ok(())
        }
        Commands::Serve { root, provide } => {
            if let Some(bind) = cli.bind {
                config.link.bind = bind;
            }
            run_server(config, root, provide).await
        }
        command => {
            // Clients take an ephemeral port unless told otherwise
            config.link.bind = cli
                .bind
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            if config.link.peer.is_none() {
                error!("No peer address; pass --peer or set link.peer in the config");
                return Err("no peer".into());
            }
            run_client(config, command).await
        }
    }
}

async fn run_server(config: Config, root: PathBuf, provide: Vec<PathBuf>) -> CliResult {
    let link = UdpTransport::bind(&config.link).await?;
    let server = Arc::new(FtpServer::new(link.clone(), config.server));
    server.set_root_dir(&root)?;
    for file in provide {
        if server.provide_file(&file) == ProvideResult::Duplicate {
            info!("{:?} already provided", file);
        }
    }

    let component = Arc::new(ServerComponent::new());
    component.register(server.clone());
    let receiver = link.spawn_receiver(component.clone());

    info!("Serving {:?} on {}", root, link.local_addr()?);

    tokio::select! {
        _ = receiver => {
            error!("Link receiver stopped");
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
    component.unregister("ftp");

    Ok(())
}

async fn run_client(config: Config, command: Commands) -> CliResult {
    let link = UdpTransport::bind(&config.link).await?;
    let client = FtpClient::new(link.clone(), config.client);
    link.spawn_receiver(Arc::new(client.clone()));

    let result = tokio::select! {
        result = execute(&client, command) => result,
        _ = signal::ctrl_c() => {
            client.cancel();
            Err(FtpResult::Cancelled)
        }
    };

    let stats = client.stats();
    debug!(
        sent = stats.frames_sent,
        received = stats.frames_received,
        retransmissions = stats.retransmissions,
        "link stats ({:.1}% retransmitted)",
        stats.retransmit_percent()
    );

    result.map_err(|kind| {
        error!("{}", kind);
        kind.into()
    })
}

async fn execute(client: &FtpClient, command: Commands) -> Result<(), FtpResult> {
    match command {
        Commands::Put { local, remote_dir } => {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let mut tx = Some(tx);
            client.upload_async(&local, &remote_dir, move |result, progress| {
                if result == FtpResult::Next {
                    debug!("{:.0}%", progress.percent());
                } else if let Some(tx) = tx.take() {
                    let _ = tx.send((result, progress));
                }
            });
            let (result, progress) = rx.await.map_err(|_| FtpResult::Cancelled)?;
            if result != FtpResult::Success {
                return Err(result);
            }
            info!("Uploaded {} bytes to {}", progress.bytes_transferred, remote_dir);
        }
        Commands::Get { remote, local_dir } => {
            client.download(&remote, &local_dir).await?;
            info!("Downloaded {} into {:?}", remote, local_dir);
        }
        Commands::Ls { path } => {
            for entry in client.list_directory(&path).await? {
                match entry.kind {
                    EntryKind::Directory => println!("{}/", entry.name),
                    _ => println!("{:>10}  {}", entry.size, entry.name),
                }
            }
        }
        Commands::Rm { path } => client.remove_file(&path).await?,
        Commands::Mkdir { path } => client.create_directory(&path).await?,
        Commands::Rmdir { path } => client.remove_directory(&path).await?,
        Commands::Mv { from, to } => client.rename(&from, &to).await?,
        Commands::Crc { path } => {
            let crc = client.calc_file_crc32(&path).await?;
            println!("{:08x}  {}", crc, path);
        }
        Commands::Cmp { local, remote } => {
            if client.are_files_identical(&local, &remote).await? {
                println!("identical");
            } else {
                println!("differ");
            }
        }
        Commands::Reset => client.reset_sessions().await?,
        Commands::Serve { .. } | Commands::SampleConfig => return Err(FtpResult::InvalidParameter),
    }
    Ok(())
}
