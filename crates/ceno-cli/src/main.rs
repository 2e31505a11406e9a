//! CENO operator CLI.
//!
//! Inspects and validates node configuration, manages the on-disk cache
//! index, and resolves single URLs through the dispatcher for debugging.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ceno_core::cache_manager::DiskStore;
use ceno_core::{CancellationToken, CenoConfig, CenoError, CenoNode};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "ceno")]
#[command(about = "Operator tools for a CENO node")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Node configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// The persisted cache index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Resolve a URL (origin, injector, static cache) and report the outcome
    Fetch {
        url: String,
        /// Configuration file (defaults apply when absent)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show { file: Option<PathBuf> },
    /// Validate a configuration file
    Check { file: PathBuf },
    /// Write a configuration file with default values
    Init {
        file: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum IndexAction {
    /// List resident entries, highest score first
    List {
        cache_dir: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Rescore entries, evict stale ones and trim to the disk budget
    Sweep {
        cache_dir: PathBuf,
        /// Configuration file providing scoring weights
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Config { action } => run_config(action),
        Command::Index { action } => run_index(action),
        Command::Fetch { url, config } => run_fetch(&url, config.as_deref()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<CenoConfig> {
    let config = match path {
        Some(path) => CenoConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CenoConfig::default(),
    };
    debug!("Loaded configuration: {:?}", config);
    Ok(config)
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { file } => {
            let config = load_config(file.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Check { file } => {
            let config = load_config(Some(&file))?;
            config
                .validate()
                .with_context(|| format!("{} is invalid", file.display()))?;
            println!("{}: ok", file.display());
        }
        ConfigAction::Init { file, force } => {
            if file.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", file.display());
            }
            CenoConfig::default().save(&file)?;
            info!("Wrote default configuration to {}", file.display());
        }
    }
    Ok(())
}

fn run_index(action: IndexAction) -> Result<()> {
    match action {
        IndexAction::List { cache_dir, json } => {
            let store = open_store(&cache_dir)?;
            if json {
                let entries: Vec<_> = store.index().entries().collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", render_table(&store));
            }
        }
        IndexAction::Sweep { cache_dir, config } => {
            let config = load_config(config.as_deref())?;
            let mut store = open_store(&cache_dir)?;
            let evicted = store.sweep(&config.scoring, Utc::now(), config.disk_budget_bytes)?;
            for url in &evicted {
                println!("evicted {}", url);
            }
            println!(
                "{} evicted, {} resident ({} bytes)",
                evicted.len(),
                store.index().len(),
                store.index().used_bytes()
            );
        }
    }
    Ok(())
}

fn open_store(cache_dir: &Path) -> Result<DiskStore> {
    if !cache_dir.is_dir() {
        bail!("cache directory {} does not exist", cache_dir.display());
    }
    DiskStore::open(cache_dir).with_context(|| format!("failed to open cache at {}", cache_dir.display()))
}

fn render_table(store: &DiskStore) -> String {
    let now = Utc::now();
    let mut entries: Vec<_> = store.index().entries().collect();
    entries.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut out = format!(
        "{:>8}  {:>10}  {:>6}  {:>5}  URL\n",
        "SCORE", "BYTES", "FRESH", "AVAIL"
    );
    for entry in &entries {
        out.push_str(&format!(
            "{:>8.3}  {:>10}  {:>6.2}  {:>5}  {}\n",
            entry.score,
            entry.size_bytes,
            entry.freshness(now),
            entry.availability,
            entry.url
        ));
    }
    out.push_str(&format!(
        "{} entries, {} bytes\n",
        entries.len(),
        store.index().used_bytes()
    ));
    out
}

async fn run_fetch(url: &str, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let node = CenoNode::builder(config)
        .cache_resolved(false)
        .start_sweeper(false)
        .build()
        .await?;

    let result = node.resolve(url, &CancellationToken::new()).await;
    node.shutdown().await;

    match result {
        Ok(resolved) => {
            for diagnostic in &resolved.diagnostics {
                println!("failed  {}", diagnostic);
            }
            println!(
                "ok      {} via {}: HTTP {}, {} bytes",
                url,
                resolved.stage,
                resolved.resource.status(),
                resolved.resource.size()
            );
            Ok(())
        }
        Err(CenoError::AggregatedFailure { diagnostics, .. }) => {
            for diagnostic in &diagnostics {
                println!("failed  {}", diagnostic);
            }
            bail!("could not resolve {}", url)
        }
        Err(e) => Err(e.into()),
    }
}
