//! Hoard Node - peer-to-peer content-addressed file store.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hoard_node::config::Config;
use hoard_node::observability::{init_logging, LogFormat};
use hoard_node::FileServer;
use hoard_p2p::TcpTransportConfig;
use hoard_storage::{Store, StoreOpts};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Hoard Node - replicated content-addressed file storage
#[derive(Parser, Debug)]
#[command(name = "hoard-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hoard.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until Ctrl+C
    Run {
        /// Listen address
        #[arg(long)]
        listen: Option<String>,

        /// Storage root
        #[arg(long)]
        root: Option<PathBuf>,

        /// Node to connect to on start (repeatable)
        #[arg(long = "bootstrap")]
        bootstrap: Vec<String>,
    },
    /// Start two local nodes and replicate one file between them
    Demo,
    /// Remove everything under a storage root
    Wipe {
        /// Storage root
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Command::Run {
        listen,
        root,
        bootstrap,
    } = &args.command
    {
        if let Some(listen) = listen {
            config.listen_addr.clone_from(listen);
        }
        if let Some(root) = root {
            config.storage_root.clone_from(root);
        }
        if !bootstrap.is_empty() {
            config.bootstrap_nodes.clone_from(bootstrap);
        }
    }
    config.validate()?;

    init_logging(&config.log_level, LogFormat::parse(&config.log_format));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Hoard node");

    match args.command {
        Command::Run { .. } => run(config).await,
        Command::Demo => demo(config).await,
        Command::Wipe { root } => wipe(config, root),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        listen_addr = %config.listen_addr,
        storage_root = %config.storage_root.display(),
        bootstrap_nodes = ?config.bootstrap_nodes,
        "Node configuration"
    );

    let (server, _transport) = FileServer::with_tcp(config.server_opts(), config.transport_config());
    let server = Arc::new(server);
    let mut task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            None
        }
        result = &mut task => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("Shutting down");
            server.stop();
            task.await
        }
    };
    result??;
    Ok(())
}

async fn demo(config: Config) -> anyhow::Result<()> {
    let node = |name: &str, bootstrap: Vec<String>| {
        let mut opts = config.server_opts();
        opts.storage_root = config.storage_root.join(name);
        opts.bootstrap_nodes = bootstrap;
        FileServer::with_tcp(opts, TcpTransportConfig::new("127.0.0.1:0"))
    };

    let (first, first_transport) = node("node-1", Vec::new());
    first.open().await?;
    let first_addr = first_transport
        .local_addr()
        .context("first node is not listening")?
        .to_string();

    let (second, _) = node("node-2", vec![first_addr]);
    second.open().await?;

    let first = Arc::new(first);
    let second = Arc::new(second);
    let tasks = [Arc::clone(&first), Arc::clone(&second)].map(|server| {
        tokio::spawn(async move { server.run().await })
    });

    let within = Duration::from_secs(5);
    anyhow::ensure!(
        first.wait_for_peers(1, within).await && second.wait_for_peers(1, within).await,
        "nodes did not connect"
    );

    let key = "myprivatekey";
    second.store_write(key, &b"Other Data!"[..]).await?;
    let data = first.store_read(key).await?;
    println!("{key} on {}: {}", first.listen_addr(), String::from_utf8_lossy(&data));

    first.stop();
    second.stop();
    for task in tasks {
        task.await??;
    }
    first.store().clear()?;
    second.store().clear()?;
    Ok(())
}

fn wipe(config: Config, root: Option<PathBuf>) -> anyhow::Result<()> {
    let root = root.unwrap_or_else(|| config.storage_root.clone());
    let store = Store::new(StoreOpts::new(root, config.path_transform_fn()));
    store.clear()?;
    tracing::info!(root = %store.root().display(), "Storage wiped");
    Ok(())
}
