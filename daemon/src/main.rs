// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Wallet Daemon
//!
//! Entry point for the `tessera-daemon` binary. Hosts one wallet: keeps its
//! token set synchronized with the configured storage gateways, finishes
//! operations interrupted by a previous run, and serves a status API.
//!
//! - `init`    : create the data directory, wallet key and config file
//! - `status`  : print the wallet's tokens, breaker and pending log
//! - `sync`    : run one sync and exit
//! - `serve`   : periodic sync + status API + metrics
//! - `version` : print build version information
//!
//! The transition network and peer transport are the in-process devnet
//! implementations; applications that move tokens embed
//! `tessera-protocol` with their own.

mod api;
mod cli;
mod config;
mod http_node;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use tessera_protocol::crypto::keys::WalletKeypair;
use tessera_protocol::devnet::{InMemoryNetwork, InMemoryStorageNode, LoopbackHub, StorageBackend};
use tessera_protocol::storage::{PointerRecord, StorageNode, WalletDb};
use tessera_protocol::token::StaticTokenRegistry;
use tessera_protocol::{Collaborators, SystemClock, Wallet};

use cli::{Commands, TesseraCli};
use config::{DaemonConfig, CONFIG_FILE_NAME};
use http_node::HttpStorageNode;
use metrics::DaemonMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraCli::parse();
    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    let config = DaemonConfig::resolve(&cli.overrides())?;
    logging::init_logging(logging::DEFAULT_DIRECTIVES, config.log_format);

    match cli.command {
        Commands::Init(args) => init_wallet(&config, args),
        Commands::Status(args) => show_status(&config, args).await,
        Commands::Sync => sync_once(&config).await,
        Commands::Serve(_) => serve(&config).await,
        Commands::Version => Ok(()),
    }
}

/// Creates the data directory, a fresh wallet key and, if missing, a
/// config file with the effective settings.
fn init_wallet(config: &DaemonConfig, args: cli::InitArgs) -> Result<()> {
    let data_dir = &config.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = config.key_path();
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }

    let keypair = WalletKeypair::generate();
    std::fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write wallet key to {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let config_path = data_dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        std::fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    let public_key = keypair.public_key();
    tracing::info!(public_key = %public_key, key_path = %key_path.display(), "wallet key generated");

    println!("Wallet initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Public key     : {}", public_key);
    println!("  Pointer name   : {}", PointerRecord::name_for(&public_key));
    Ok(())
}

fn load_keypair(config: &DaemonConfig) -> Result<WalletKeypair> {
    let key_path = config.key_path();
    let text = std::fs::read_to_string(&key_path).with_context(|| {
        format!(
            "failed to read wallet key {} (run `tessera-daemon init` first)",
            key_path.display()
        )
    })?;
    WalletKeypair::from_hex(text.trim())
        .with_context(|| format!("{} is not a valid wallet key", key_path.display()))
}

/// Builds the wallet from its on-disk key and database plus the configured
/// storage nodes.
fn open_wallet(config: &DaemonConfig) -> Result<(Arc<Wallet>, WalletDb)> {
    let keypair = load_keypair(config)?;

    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = WalletDb::open(&db_path)
        .with_context(|| format!("failed to open wallet database at {}", db_path.display()))?;

    let mut storage_nodes: Vec<Arc<dyn StorageNode>> = Vec::new();
    for endpoint in &config.storage_nodes {
        let node = HttpStorageNode::new(endpoint, config.request_timeout())
            .with_context(|| format!("failed to set up storage node {}", endpoint.id))?;
        storage_nodes.push(Arc::new(node));
    }
    if config.devnet {
        storage_nodes.push(Arc::new(InMemoryStorageNode::new("devnet", StorageBackend::new())));
    }

    let peer_id = keypair.public_key().to_hex();
    let wallet = Wallet::open(
        keypair,
        db.clone(),
        Collaborators {
            network: Arc::new(InMemoryNetwork::new()),
            transport: LoopbackHub::new().endpoint(&peer_id),
            storage_nodes,
            registry: Arc::new(StaticTokenRegistry::new()),
        },
        Arc::new(SystemClock),
        config.wallet_config(),
    )
    .context("failed to open wallet")?;
    Ok((Arc::new(wallet), db))
}

async fn show_status(config: &DaemonConfig, args: cli::StatusArgs) -> Result<()> {
    if let Some(api_url) = args.api_url {
        let url = format!("{}/status", api_url.trim_end_matches('/'));
        let response = reqwest::get(&url)
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?;
        let status: serde_json::Value = response.json().await.context("invalid status response")?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let (wallet, _db) = open_wallet(config)?;
    let status = wallet.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn sync_once(config: &DaemonConfig) -> Result<()> {
    let (wallet, db) = open_wallet(config)?;
    let result = wallet.sync.sync_now().await;
    db.flush()?;
    let outcome = result.context("sync failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn serve(config: &DaemonConfig) -> Result<()> {
    let (wallet, db) = open_wallet(config)?;
    let metrics = Arc::new(DaemonMetrics::new().context("failed to register metrics")?);

    match wallet.protocol.recover_pending().await {
        Ok(report) => tracing::info!(
            completed = report.completed,
            still_pending = report.still_pending,
            dropped = report.dropped,
            "transaction log recovered"
        ),
        Err(e) => tracing::warn!(error = %e, "transaction log recovery failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = wallet.start(shutdown_rx.clone());
    tasks.push(tokio::spawn(metrics::track_events(
        metrics.clone(),
        wallet.events.subscribe(),
        shutdown_rx,
    )));

    let state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            tessera_protocol::config::PROTOCOL_VERSION,
        ),
        wallet: wallet.clone(),
        metrics,
    };
    let listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("failed to bind status API on {}", config.api_addr))?;
    tracing::info!(
        addr = %config.api_addr,
        public_key = %wallet.public_key(),
        storage_nodes = wallet.resolver.node_count(),
        "tessera-daemon serving"
    );

    axum::serve(listener, api::create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("status API failed")?;

    tracing::info!("shutdown signal received, stopping background tasks");
    // Errs only when every task has already exited.
    let _ = shutdown_tx.send(true);
    futures::future::join_all(tasks).await;
    db.flush()?;
    tracing::info!("tessera-daemon stopped");
    Ok(())
}

fn print_version() {
    println!("tessera-daemon {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", tessera_protocol::config::PROTOCOL_VERSION);
    println!("snapshot fmt   {}", tessera_protocol::config::SNAPSHOT_FORMAT_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
