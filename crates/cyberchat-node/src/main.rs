//! CyberChat node: a zero-configuration, serverless LAN chat and
//! file-sharing peer. Every node runs this same binary; there is no
//! coordinator and all state is local.

mod api;
mod config;
mod cooldown;
mod error;
mod events;
mod files;
mod peers;
mod pipeline;
mod state;
mod tls;
mod ws;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cyberchat_discovery::DiscoveryService;
use cyberchat_shared::constants::{
    DEFAULT_PORT, DELIVERY_TIMEOUT, MESSAGE_MAX_AGE, PROBE_TIMEOUT,
};
use cyberchat_shared::{Identity, Peer};
use cyberchat_store::settings::{
    SETTING_CLIENT_API_KEY, SETTING_GUID, SETTING_NAME, SETTING_PRIVATE_KEY, SETTING_PUBLIC_KEY,
};
use cyberchat_store::Database;

use crate::config::{default_data_dir, NodeConfig};
use crate::events::EventBus;
use crate::peers::PeerManager;
use crate::pipeline::MessagePipeline;
use crate::state::{AppState, SharedDb};

const DB_FILE: &str = "cyberchat.db";
const MAX_PORT_ATTEMPTS: u16 = 100;

/// CyberChat: secure serverless peer-to-peer chat for the local network.
#[derive(Parser)]
#[command(name = "cyberchat", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Custom data directory (default: ~/.cyberchat).
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Display name advertised to peers.
    #[arg(short, long)]
    name: Option<String>,

    /// Reset all data and start fresh.
    #[arg(short, long)]
    reset: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig {
        port: cli.port,
        data_dir: cli.data_dir.unwrap_or_else(default_data_dir),
        name: cli.name,
        debug: cli.debug,
    };

    if cli.reset {
        reset_data(&config.data_dir)?;
        println!("CyberChat data reset complete. You can now start fresh.");
        return Ok(());
    }

    let default_filter = if config.debug {
        "info,cyberchat_node=debug,cyberchat_discovery=debug,cyberchat_store=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting CyberChat v{}", env!("CARGO_PKG_VERSION"));

    run(config).await
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let database = Database::open_at(&config.data_dir.join(DB_FILE))?;
    if let Some(name) = &config.name {
        database.set_setting(SETTING_NAME, name)?;
    }
    let display_name = database.display_name()?;

    let identity = Arc::new(load_identity(&database)?);
    let client_api_key = load_client_api_key(&database)?;
    let db: SharedDb = Arc::new(Mutex::new(database));

    let (cert_path, key_path) = tls::ensure_certificates(&config.data_dir)?;
    let port = find_available_port(config.port)?;
    if port != config.port {
        info!(requested = config.port, port, "configured port busy, using fallback");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus = Arc::new(EventBus::new());
    let peers = Arc::new(PeerManager::new(db.clone(), bus.clone()));
    let (discovery, observations) = DiscoveryService::new(
        identity.guid(),
        port,
        display_name.clone(),
        shutdown_rx.clone(),
    )?;
    let pipeline = Arc::new(MessagePipeline::new(
        identity.clone(),
        db.clone(),
        bus.clone(),
        peers.clone(),
        discovery.clone(),
        pipeline::insecure_client(DELIVERY_TIMEOUT).context("delivery client")?,
        pipeline::insecure_client(PROBE_TIMEOUT).context("probe client")?,
    ));

    let app_state = AppState {
        db: db.clone(),
        identity: identity.clone(),
        bus,
        peers: peers.clone(),
        discovery: discovery.clone(),
        pipeline,
        client_api_key,
    };

    // Advertisement failure is fatal; everything else degrades.
    discovery.start()?;

    spawn_observation_consumer(peers, observations, shutdown_rx.clone());
    spawn_message_retention(db.clone(), shutdown_rx);

    let rustls = RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .context("loading TLS certificates")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let handle = axum_server::Handle::new();
    let router = api::build_router(app_state);

    info!(
        port,
        node = %identity.guid(),
        name = %display_name,
        "CyberChat server listening"
    );
    info!("Access client: https://127.0.0.1:{port}");

    let server_handle = handle.clone();
    let server = tokio::spawn(async move {
        axum_server::bind_rustls(addr, rustls)
            .handle(server_handle)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // Ordered shutdown: stop advertising first, then drain the HTTP
    // surface with a grace period, then close the store.
    let _ = shutdown_tx.send(true);
    discovery.stop();
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    server.await.context("server task")??;
    drop(db);

    info!("shutdown complete");
    Ok(())
}

/// Restore the persisted identity, or mint one on first start.
fn load_identity(db: &Database) -> anyhow::Result<Identity> {
    let guid = db.get_setting(SETTING_GUID)?;
    let pem = db.get_setting(SETTING_PRIVATE_KEY)?;

    match (guid, pem) {
        (Some(guid), Some(pem)) => {
            let guid = Uuid::parse_str(&guid).context("stored GUID is invalid")?;
            Ok(Identity::from_pem(guid, &pem)?)
        }
        _ => {
            let identity = Identity::generate()?;
            db.set_setting(SETTING_GUID, &identity.guid().to_string())?;
            db.set_setting(SETTING_PRIVATE_KEY, &identity.private_key_pem()?)?;
            db.set_setting(SETTING_PUBLIC_KEY, &identity.public_key_pem()?)?;
            info!(node = %identity.guid(), "generated new node identity");
            Ok(identity)
        }
    }
}

fn load_client_api_key(db: &Database) -> anyhow::Result<String> {
    if let Some(key) = db.get_setting(SETTING_CLIENT_API_KEY)? {
        return Ok(key);
    }
    let key = Uuid::new_v4().to_string();
    db.set_setting(SETTING_CLIENT_API_KEY, &key)?;
    Ok(key)
}

/// Probe upward from the configured port until one binds.
fn find_available_port(start: u16) -> anyhow::Result<u16> {
    for offset in 0..MAX_PORT_ATTEMPTS {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
        if offset == 0 {
            info!(port, "port in use, trying next");
        }
    }
    anyhow::bail!("no available port within {MAX_PORT_ATTEMPTS} attempts of {start}")
}

/// Single consumer of the observation stream; the manager's change
/// callback runs inline, so callbacks fire in observation order.
fn spawn_observation_consumer(
    peers: Arc<PeerManager>,
    mut observations: mpsc::Receiver<Peer>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                observed = observations.recv() => match observed {
                    Some(peer) => peers.handle_observation(peer),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Daily sweep of stored messages past the retention window.
fn spawn_message_retention(db: SharedDb, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(24 * 60 * 60)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let cutoff = Utc::now() - MESSAGE_MAX_AGE;
            match db.lock().delete_messages_older_than(cutoff) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "cleaned up old messages"),
                Err(e) => error!(error = %e, "message cleanup failed"),
            }
        }
    });
}

/// Wipe the database, certificate, and key for a factory-fresh start.
fn reset_data(data_dir: &Path) -> anyhow::Result<()> {
    let files = [
        DB_FILE,
        "cyberchat.db-wal",
        "cyberchat.db-shm",
        tls::CERT_FILE,
        tls::KEY_FILE,
    ];
    for file in files {
        let path = data_dir.join(file);
        match std::fs::remove_file(&path) {
            Ok(()) => println!("removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}
