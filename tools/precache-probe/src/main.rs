//! Command-line access to PwaKit cache stores.
//!
//! Runs the same install and activation steps as the worker against a
//! directory of on-disk stores, which makes it easy to check that a
//! deployment's precache manifest is complete before shipping it.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the configured app shell from a running deployment
//! precache-probe --cache-dir ./cache precache --origin http://localhost:8080
//!
//! # Drop every store but the configured version's
//! precache-probe --cache-dir ./cache --config pwa.json purge
//!
//! # Show stores and entry counts
//! precache-probe --cache-dir ./cache list --json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pwakit_common::{init_logging, LogConfig, PwaConfig};
use pwakit_net::client::{HttpFetcher, LoaderConfig};
use pwakit_net::Fetch;
use pwakit_sw::{
    ActivationReport, CacheLifecycleManager, CacheStorage, CacheVersion, DiskCacheStorage,
    InstallReport, PrecacheManifest,
};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "precache-probe")]
#[command(about = "Install, purge and inspect PwaKit offline cache stores")]
struct Cli {
    /// Directory holding the cache stores
    #[arg(long, global = true, default_value = ".pwakit-cache")]
    cache_dir: PathBuf,

    /// PWA configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every precache manifest entry into the current version's store
    Precache {
        /// Origin the app is deployed on
        #[arg(long, default_value = "http://localhost:8080")]
        origin: Url,
        /// Override the configured version tag
        #[arg(long)]
        version: Option<String>,
    },

    /// Delete every store except the current version's
    Purge {
        /// Override the configured version tag
        #[arg(long)]
        version: Option<String>,
    },

    /// List stores and their entry counts
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct StoreSummary {
    name: String,
    entries: usize,
    current: bool,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config)?;

    let config = load_config(cli.config.as_deref())?;
    let storage = Arc::new(DiskCacheStorage::open_dir(&cli.cache_dir).await?);
    debug!(dir = %storage.root().display(), "Opened cache directory");

    match cli.command {
        Commands::Precache { origin, version } => {
            let fetcher = Arc::new(HttpFetcher::new(LoaderConfig {
                timeout: config.network_timeout(),
                ..Default::default()
            })?);
            let report = precache(&config, version, &origin, storage, fetcher).await?;
            println!("Installed {} entries into {}", report.cached, report.cache_name);
        }

        Commands::Purge { version } => {
            let report = purge(&config, version, storage).await?;
            println!("Kept {}", report.kept);
            for name in &report.purged {
                println!("Purged {name}");
            }
        }

        Commands::List { json } => {
            let stores = list_stores(&config, storage.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stores)?);
            } else if stores.is_empty() {
                println!("No stores in {}", cli.cache_dir.display());
            } else {
                for store in &stores {
                    let marker = if store.current { "*" } else { " " };
                    println!("{marker} {:<40} {:>6} entries", store.name, store.entries);
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> CliResult<PwaConfig> {
    let config = match path {
        Some(path) => PwaConfig::load(path)?,
        None => PwaConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn lifecycle_manager(
    config: &PwaConfig,
    version: Option<String>,
    origin: &Url,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetch>,
) -> CliResult<CacheLifecycleManager> {
    let version = CacheVersion::new(version.unwrap_or_else(|| config.cache_version.clone()));
    let scope = origin.join(&config.base_path)?;
    Ok(CacheLifecycleManager::new(
        version.clone(),
        version.store_name(&config.cache_prefix),
        PrecacheManifest::new(config.precache.clone()),
        scope,
        storage,
        fetcher,
        config.network_timeout(),
    ))
}

async fn precache(
    config: &PwaConfig,
    version: Option<String>,
    origin: &Url,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetch>,
) -> CliResult<InstallReport> {
    let manager = lifecycle_manager(config, version, origin, storage, fetcher)?;
    info!(cache = manager.cache_name(), origin = %origin, "Precaching");
    Ok(manager.install().await?)
}

async fn purge(
    config: &PwaConfig,
    version: Option<String>,
    storage: Arc<dyn CacheStorage>,
) -> CliResult<ActivationReport> {
    // Activation never touches the network.
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let origin = Url::parse("http://localhost/")?;
    let manager = lifecycle_manager(config, version, &origin, storage, fetcher)?;
    Ok(manager.activate().await?)
}

async fn list_stores(config: &PwaConfig, storage: &dyn CacheStorage) -> CliResult<Vec<StoreSummary>> {
    let current = config.cache_name();
    let mut stores = Vec::new();
    for name in storage.list_names().await? {
        let entries = storage.keys(&name).await?.len();
        stores.push(StoreSummary {
            current: name == current,
            name,
            entries,
        });
    }
    Ok(stores)
}
