use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use kasumi_core::{
    BackendFactory, CONTROL_RELOAD, CONTROL_STAT, CONTROL_SYNC, Config, MemoryBackend, Worker,
    control_request, read_stat_document, spawn_control,
};

#[derive(Parser)]
#[command(name = "kasumi")]
#[command(about = "Fuzzy hash storage worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage worker
    Serve {
        /// Path to the TOML configuration
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
        /// Worker index; index 0 owns the single writer role
        #[arg(long, default_value_t = 0)]
        worker_index: usize,
        /// Inherited peer-pipe descriptor from the supervisor
        #[arg(long)]
        peer_fd: Option<i32>,
    },
    /// Send an admin command to a running worker
    Control {
        /// Control socket path
        #[arg(long, short = 's')]
        socket: PathBuf,
        /// One of: reload, sync, stat
        command: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            worker_index,
            peer_fd,
        } => serve(config, worker_index, peer_fd),
        Commands::Control { socket, command } => control(&socket, &command),
    }
}

fn serve(config_path: Option<PathBuf>, worker_index: usize, peer_fd: Option<i32>) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => {
            warn!("no config given, using built-in defaults");
            Config::default()
        }
    };

    // One cooperative event loop per worker process.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build worker runtime")?;

    runtime.block_on(async move {
        let peer = match peer_fd {
            Some(fd) => {
                // Safety: the supervisor handed us this descriptor on exec.
                let std_sock = unsafe {
                    std::os::unix::net::UnixDatagram::from_raw_fd(fd)
                };
                std_sock.set_nonblocking(true)?;
                Some(tokio::net::UnixDatagram::from_std(std_sock)?)
            }
            None => None,
        };

        let backend_factory: BackendFactory =
            Arc::new(|| Ok(Arc::new(MemoryBackend::new()) as Arc<dyn kasumi_core::FuzzyBackend>));
        let backend = backend_factory()?;

        let worker = Worker::start(&config, backend, worker_index, peer).await?;

        let _control_task = match (&config.control_socket, worker_index) {
            (Some(path), 0) => Some(spawn_control(
                Arc::clone(&worker.ctx),
                PathBuf::from(path),
                Arc::clone(&backend_factory),
            )?),
            _ => None,
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });

        worker.run(shutdown_rx).await
    })
}

fn control(socket: &PathBuf, command: &str) -> Result<()> {
    let cmd = match command {
        "reload" => CONTROL_RELOAD,
        "sync" => CONTROL_SYNC,
        "stat" => CONTROL_STAT,
        other => anyhow::bail!("unknown control command {other:?}"),
    };

    let (status, file) = control_request(socket, cmd)?;
    if status != 0 {
        anyhow::bail!("worker reported status {status}");
    }

    if let Some(mut file) = file {
        let doc = read_stat_document(&mut file)?;
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("ok");
    }

    Ok(())
}
