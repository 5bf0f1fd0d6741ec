//! CLI commands for the switch daemon
//!
//! Implements all command handlers for the CLI interface.

use chrono::Utc;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::KeyPair;
use crate::network::{
    AddrBook, AddrManager, BanTable, DefaultListener, Listener, NetAddress, NodeInfo, P2pConfig,
    PingReactor, Switch,
};
use crate::storage::FileStore;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Node key file name inside the data directory
pub const NODE_KEY_FILE: &str = "node_key.json";

/// Optional config file inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Interval between peer count reports
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Command line overrides for `start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub listen: Option<String>,
    pub peers: Vec<String>,
    pub max_peers: Option<usize>,
    pub moniker: String,
    pub network: String,
}

/// Load `config.json` from the data directory, or defaults if it is missing
pub fn load_config(data_dir: &Path) -> CliResult<P2pConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(P2pConfig::default());
    }

    let file = fs::File::open(&path)?;
    let config = serde_json::from_reader(BufReader::new(file))?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

fn open_ban_table(data_dir: &Path, config: &P2pConfig) -> CliResult<BanTable> {
    let store = FileStore::open(data_dir.join(&config.store_file))?;
    Ok(BanTable::load(Arc::new(store), config.ban_duration())?)
}

/// Create the node key if needed and print the node id
pub fn cmd_keygen(data_dir: &PathBuf) -> CliResult<()> {
    let path = data_dir.join(NODE_KEY_FILE);
    let existed = path.exists();
    let key = KeyPair::load_or_generate(&path)?;

    if existed {
        println!("🔑 Node key already exists at {:?}", path);
    } else {
        println!("🔐 New node key created at {:?}", path);
    }
    println!("   ├─ Node ID: {}", key.node_id());
    println!("   └─ Public Key: {}", key.public_key_hex());

    Ok(())
}

/// Run the switch until Ctrl+C
pub async fn cmd_start(data_dir: &PathBuf, options: StartOptions) -> CliResult<()> {
    let mut config = load_config(data_dir)?;
    if let Some(listen) = options.listen {
        config.listen_address = listen;
    }
    if let Some(max_peers) = options.max_peers {
        config.max_num_peers = max_peers;
    }
    config.seeds.extend(options.peers);

    let key = KeyPair::load_or_generate(&data_dir.join(NODE_KEY_FILE))?;
    let store = Arc::new(FileStore::open(data_dir.join(&config.store_file))?);
    let addr_book = Arc::new(AddrManager::load(data_dir.join(&config.addr_book_file))?);

    let listener = Arc::new(DefaultListener::bind(&config.listen_address).await?);
    // Record the bound port in case the configured one was 0
    config.listen_address = listener.internal_address().to_string();
    let advertised = config.advertised_address().to_string();
    let node_info = NodeInfo::new(&options.moniker, &options.network, &advertised);

    let mut switch = Switch::new(config.clone(), node_info, key, addr_book.clone(), store)?;
    switch.add_reactor("ping", Arc::new(PingReactor::new()));
    switch.add_listener(listener);
    let switch = Arc::new(switch);
    switch.start()?;

    println!("🌐 Switch running");
    println!("   ├─ Node ID: {}", switch.node_id());
    println!("   ├─ Listening: {}", advertised);
    println!("   └─ Network: {}", switch.node_info().network);

    let mut targets = config.seeds.clone();
    targets.extend(
        addr_book
            .addresses()
            .into_iter()
            .take(config.max_num_peers)
            .map(|addr| addr.to_string()),
    );
    for target in targets {
        let switch = switch.clone();
        let addr_book = addr_book.clone();
        tokio::spawn(async move {
            let addr = match NetAddress::resolve(&target).await {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("Skipping peer {}: {}", target, e);
                    return;
                }
            };
            addr_book.attempt(&addr);
            match switch.dial_peer_with_address(&addr).await {
                Ok(peer) => log::info!("Connected to {}", peer),
                Err(e) => log::warn!("Failed to connect to {}: {}", addr, e),
            }
        });
    }

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let counts = switch.num_peers();
                log::info!(
                    "Peers: {} outbound, {} inbound, {} dialing",
                    counts.outbound,
                    counts.inbound,
                    counts.dialing
                );
            }
        }
    }

    println!("\n📴 Shutting down switch...");
    switch.stop().await;
    addr_book.save_to_file()?;

    Ok(())
}

/// List banned hosts
pub fn cmd_bans_list(data_dir: &PathBuf) -> CliResult<()> {
    let config = load_config(data_dir)?;
    let bans = open_ban_table(data_dir, &config)?;
    let entries = bans.entries();

    if entries.is_empty() {
        println!("📭 No banned hosts");
        return Ok(());
    }

    let now = Utc::now();
    println!("🚫 Banned hosts:");
    for (host, expiry) in &entries {
        let state = if *expiry > now { "active" } else { "expired" };
        println!("   {} until {} ({})", host, expiry.format("%Y-%m-%d %H:%M:%S"), state);
    }

    Ok(())
}

/// Ban a host, for `duration_secs` or the configured default
pub fn cmd_bans_add(data_dir: &PathBuf, host: &str, duration_secs: Option<u64>) -> CliResult<()> {
    let config = load_config(data_dir)?;
    let bans = open_ban_table(data_dir, &config)?;

    let expiry = match duration_secs {
        Some(secs) => {
            let expiry = Utc::now() + chrono::Duration::seconds(secs as i64);
            bans.ban_until(host, expiry)?;
            expiry
        }
        None => bans.ban(host)?,
    };

    println!("✅ Banned {} until {}", host, expiry.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

/// Lift a ban
pub fn cmd_bans_remove(data_dir: &PathBuf, host: &str) -> CliResult<()> {
    let config = load_config(data_dir)?;
    let bans = open_ban_table(data_dir, &config)?;

    if bans.unban(host)? {
        println!("✅ Unbanned {}", host);
    } else {
        println!("⚠️  {} was not banned", host);
    }
    Ok(())
}
