//! rivven-servant - sharded MySQL data-access servant
//!
//! # Usage
//!
//! ```bash
//! # Run the servant (reloads servant.yaml on SIGHUP)
//! rivven-servant -c servant.yaml
//!
//! # Validate configuration
//! rivven-servant -c servant.yaml validate
//!
//! # Dial every configured server once
//! rivven-servant -c servant.yaml ping
//!
//! # One-off routed statement
//! rivven-servant -c servant.yaml query --pool UserShard --table UserInfo --hint 42 \
//!     --sql "SELECT name FROM UserInfo WHERE uid=?" --arg 42
//!
//! # One-off JSON merge
//! rivven-servant -c servant.yaml merge --pool UserShard --table UserInfo --hint 42 \
//!     --predicate "uid=42" --key user:42 --column profile --patch '{"theme":"dark"}'
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_servant::mysql::MySqlConnectionFactory;
use rivven_servant::prelude::*;

#[derive(Parser)]
#[command(name = "rivven-servant")]
#[command(version, about = "Sharded MySQL data-access servant")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "servant.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve until interrupted (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Dial every configured server and report the outcome
    Ping,
    /// Route and execute one statement
    Query {
        /// Logical pool
        #[arg(long)]
        pool: String,
        /// Table, used for logging and cache keys
        #[arg(long)]
        table: String,
        /// Routing hint
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        hint: i64,
        /// SQL text with `?` placeholders
        #[arg(long)]
        sql: String,
        /// Positional argument (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Predicate identifying the cached read
        #[arg(long)]
        cache_predicate: Option<String>,
    },
    /// Merge a JSON patch into one row's JSON column
    Merge {
        /// Logical pool
        #[arg(long)]
        pool: String,
        /// Table
        #[arg(long)]
        table: String,
        /// Routing hint
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        hint: i64,
        /// WHERE clause selecting exactly one row
        #[arg(long)]
        predicate: String,
        /// Merge key serializing concurrent merges
        #[arg(long)]
        key: String,
        /// JSON column
        #[arg(long)]
        column: String,
        /// JSON object to merge
        #[arg(long)]
        patch: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, cli.config).await,
        Commands::Validate => validate(&config),
        Commands::Ping => ping(config).await,
        Commands::Query {
            pool,
            table,
            hint,
            sql,
            args,
            cache_predicate,
        } => {
            let mut req = QueryRequest::new(pool, table, hint, sql).with_args(args);
            if let Some(predicate) = cache_predicate {
                req = req.with_cache_predicate(predicate);
            }
            query(config, req).await
        }
        Commands::Merge {
            pool,
            table,
            hint,
            predicate,
            key,
            column,
            patch,
        } => {
            let req = MergeRequest {
                pool,
                table,
                hint,
                predicate,
                key,
                column,
                patch,
            };
            merge(config, req).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn load_config(path: &Path) -> Result<ServantConfig> {
    ServantConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn start(config: ServantConfig) -> Result<Arc<Servant>> {
    Servant::new(config, Arc::new(MySqlConnectionFactory)).context("Failed to start servant")
}

fn cli_context(command: &str) -> CallContext {
    CallContext::new(format!("cli-{}-{}", command, std::process::id())).with_caller("rivven-servant")
}

fn validate(config: &ServantConfig) -> Result<()> {
    let topology = ShardTopology::from_config(&config.mysql).context("Invalid topology")?;

    println!("✓ Configuration is valid");
    println!();
    println!("Strategy: {} (shard base {})", topology.strategy().name(), topology.shard_base());
    println!("Cache: {}", config.mysql.cache.store);
    println!();
    for pool in topology.pools() {
        let kind = if topology.is_global(pool) { "global" } else { "sharded" };
        println!("Pool {} ({}):", pool, kind);
        for (index, server) in topology.servers_of(pool).iter().enumerate() {
            println!("  [{}] {}", index, server.address());
        }
    }
    if !config.mysql.enabled() {
        println!("No servers configured");
    }
    Ok(())
}

async fn ping(config: ServantConfig) -> Result<()> {
    let servant = start(config)?;
    let outcomes = servant.warm_up().await;
    servant.close();

    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    if failed > 0 {
        bail!("{} of {} servers unreachable", failed, outcomes.len());
    }
    Ok(())
}

async fn query(config: ServantConfig, req: QueryRequest) -> Result<()> {
    let servant = start(config)?;
    let result = servant.query(&cli_context("query"), &req).await;
    servant.close();

    let result = result.with_context(|| format!("{} on {}.{} failed", req.kind(), req.pool, req.table))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn merge(config: ServantConfig, req: MergeRequest) -> Result<()> {
    let servant = start(config)?;
    let result = servant.merge(&cli_context("merge"), &req).await;
    servant.close();

    result.with_context(|| format!("merge on {}.{} key {} failed", req.pool, req.table, req.key))?;
    println!("merged");
    Ok(())
}

async fn run(config: ServantConfig, path: PathBuf) -> Result<()> {
    info!("Starting rivven-servant");

    let servant = start(config.clone())?;
    servant.warm_up().await;

    let (updates_tx, updates_rx) = tokio::sync::watch::channel(config);
    let reloader = servant.spawn_reload_listener(updates_rx);
    let reporter = servant.spawn_stats_reporter();
    let signals = tokio::spawn(watch_reload_signal(path, updates_tx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    signals.abort();
    servant.close();
    let _ = reloader.await;
    let _ = reporter.await;

    let snapshot = servant.runtime();
    info!(
        generation = snapshot.generation,
        calls = snapshot.calls.total_calls(),
        errors = snapshot.calls.errors,
        "rivven-servant stopped"
    );
    Ok(())
}

/// Re-read the configuration file on SIGHUP and publish it
#[cfg(unix)]
async fn watch_reload_signal(path: PathBuf, updates: tokio::sync::watch::Sender<ServantConfig>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("SIGHUP handler unavailable, reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", path.display());
        match ServantConfig::from_file(&path) {
            Ok(config) => {
                if updates.send(config).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Ignoring invalid configuration: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn watch_reload_signal(_path: PathBuf, _updates: tokio::sync::watch::Sender<ServantConfig>) {
    std::future::pending::<()>().await
}
