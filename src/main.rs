//! kiwi-node: replicated link-sharing log node
//!
//! Runs the admission API, the single store writer, the registry refresher
//! and the P2P sync layer. `keygen` and `sign` are local helpers for
//! producing identities and signed messages.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use kiwi_node::admission::{unix_now, Admission};
use kiwi_node::api::{create_router, ApiState};
use kiwi_node::config::Config;
use kiwi_node::message::{Identity, Message, MessageBody, MessageKind};
use kiwi_node::moderation::{ModerationCache, ModerationLists};
use kiwi_node::p2p::{self, transport::parse_peer_addr};
use kiwi_node::query::QueryEngine;
use kiwi_node::registry::{FileRegistry, HttpRegistry, Registry, RegistrySnapshot, SnapshotCache, StaticRegistry};
use kiwi_node::store::{spawn_writer, LeafStore};
use kiwi_node::sync::{SyncCoordinator, SyncService, SyncStatus};
use kiwi_node::validation::Validator;

#[derive(Parser)]
#[command(name = "kiwi-node")]
#[command(about = "Replicated, allowlist-gated log of signed link submissions")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "kiwi-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "KIWI_DATA_DIR")]
    data_dir: Option<String>,

    /// HTTP API port (overrides config file)
    #[arg(long, env = "KIWI_HTTP_PORT")]
    http_port: Option<u16>,

    /// Registry snapshot file (overrides config file)
    #[arg(long, env = "KIWI_REGISTRY_FILE")]
    registry_file: Option<PathBuf>,

    /// Registry oracle URL (overrides config file)
    #[arg(long, env = "KIWI_REGISTRY_URL")]
    registry_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh identity and its secret key
    Keygen,
    /// Sign a message and print it as JSON
    Sign {
        /// Hex secret key (from `keygen`)
        #[arg(long, env = "KIWI_SECRET_KEY")]
        secret: String,
        /// submission, upvote or comment
        #[arg(long, default_value = "submission")]
        kind: String,
        #[arg(long)]
        href: String,
        /// Title or comment text
        #[arg(long)]
        title: Option<String>,
        /// Unix seconds; defaults to now
        #[arg(long)]
        timestamp: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kiwi_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Keygen) => return keygen(),
        Some(Command::Sign {
            ref secret,
            ref kind,
            ref href,
            ref title,
            timestamp,
        }) => return sign(secret, kind, href, title.clone(), timestamp),
        None => {}
    }

    info!("Starting kiwi-node");
    info!("Config file: {}", cli.config);

    // Load or create default config
    let mut config = if Path::new(&cli.config).exists() {
        Config::from_file(Path::new(&cli.config))
            .with_context(|| format!("loading {}", cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(file) = cli.registry_file {
        config.registry.file = Some(file);
    }
    if let Some(url) = cli.registry_url {
        config.registry.url = Some(url);
    }

    info!("Node ID: {}", config.node.id);
    info!("Data dir: {}", config.node.data_dir.display());

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let data_dir = config.node.data_dir.clone();

    // --- Store ---
    let store = Arc::new(LeafStore::open(&data_dir).context("opening leaf store")?);
    let (writer, _writer_task) = spawn_writer(store.clone(), config.sync.ingest_queue_capacity);

    // --- Registry ---
    let registry: Arc<dyn Registry> = match (&config.registry.url, &config.registry.file) {
        (Some(url), _) => {
            info!(%url, "Using registry oracle");
            Arc::new(HttpRegistry::new(url.clone()))
        }
        (None, Some(file)) => {
            info!(file = %file.display(), "Using registry file");
            Arc::new(FileRegistry::new(file.clone()))
        }
        (None, None) => {
            warn!("No registry configured; every message will be rejected");
            Arc::new(StaticRegistry::new(RegistrySnapshot::default()))
        }
    };
    let cache = Arc::new(SnapshotCache::new(registry));
    if let Err(e) = cache.refresh().await {
        warn!(error = %e, "Initial registry refresh failed, admission closed until it succeeds");
    }
    cache
        .clone()
        .spawn_refresh(Duration::from_secs(config.registry.refresh_secs.max(1)));

    // --- Moderation ---
    let moderation = match &config.moderation.file {
        Some(path) => {
            let cache = ModerationCache::open(path.clone())
                .await
                .with_context(|| format!("loading moderation lists from {}", path.display()))?;
            let cache = Arc::new(cache);
            cache
                .clone()
                .spawn_refresh(Duration::from_secs(config.registry.refresh_secs.max(1)));
            cache
        }
        None => Arc::new(ModerationCache::fixed(ModerationLists::default())),
    };

    let admission = Admission::new(
        Validator::new(config.admission.freshness),
        cache.clone(),
        writer,
    );

    // --- P2P Layer ---
    let mut peer_id = None;
    let mut sync_status = watch::channel(SyncStatus::default()).1;
    match p2p::build_swarm(&config.p2p, &data_dir) {
        Ok(swarm) => {
            info!(peer_id = %swarm.local_peer_id(), "P2P swarm built");
            peer_id = Some(swarm.local_peer_id().to_string());

            let service = SyncService::new(admission.clone(), config.sync.limits());
            let mut coordinator = SyncCoordinator::new(service, &config.sync);
            for node in &config.p2p.bootstrap_nodes {
                match parse_peer_addr(node) {
                    Some((peer, addr)) => coordinator.add_bootstrap(peer, addr),
                    None => warn!(addr = %node, "Invalid bootstrap node address, skipping"),
                }
            }
            sync_status = coordinator.status();

            // Channels between swarm event loop and coordinator
            let (swarm_event_tx, swarm_event_rx) = mpsc::channel(256);
            let (swarm_cmd_tx, swarm_cmd_rx) = mpsc::channel(256);

            tokio::spawn(swarm.run(swarm_event_tx, swarm_cmd_rx));
            tokio::spawn(coordinator.run(swarm_event_rx, swarm_cmd_tx));

            info!("P2P sync layer started");
        }
        Err(e) => {
            error!(error = %e, "Failed to build P2P swarm, running without P2P");
        }
    }

    // --- API ---
    let state = Arc::new(ApiState {
        node_id: config.node.id.clone(),
        peer_id,
        query: QueryEngine::new(store.clone(), config.admission.max_page_size),
        admission,
        store,
        registry: cache,
        moderation,
        sync_status,
    });
    let app = create_router(state);

    let ip = config
        .api
        .bind
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let addr = SocketAddr::new(ip, config.api.http_port);
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn keygen() -> anyhow::Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    println!("identity: {}", Identity::from_signing_key(&key));
    println!("secret:   {}", hex::encode(key.to_bytes()));
    Ok(())
}

fn sign(
    secret: &str,
    kind: &str,
    href: &str,
    title: Option<String>,
    timestamp: Option<u64>,
) -> anyhow::Result<()> {
    let bytes: [u8; 32] = hex::decode(secret.trim())
        .context("secret is not hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret must be 32 bytes"))?;
    let key = SigningKey::from_bytes(&bytes);

    let href = href.to_string();
    let body = match (MessageKind::parse(kind), title) {
        (Some(MessageKind::Submission), Some(title)) => MessageBody::Submission { href, title },
        (Some(MessageKind::Comment), Some(title)) => MessageBody::Comment { href, title },
        (Some(MessageKind::Upvote), None) => MessageBody::Upvote { href },
        (Some(MessageKind::Upvote), Some(_)) => bail!("upvotes carry no title"),
        (Some(_), None) => bail!("--title is required for {}", kind),
        (None, _) => bail!("unknown kind '{}'", kind),
    };

    let message = Message::sign(&key, body, timestamp.unwrap_or_else(unix_now));
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}
