//! tiercache command line
//!
//! Operates a filesystem-backed cache location:
//!
//! ```text
//! tiercache --dir /var/cache/artifacts set build/app.o ./app.o
//! tiercache --dir /var/cache/artifacts get build/app.o > app.o
//! tiercache --dir /var/cache/artifacts status --prometheus
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    Cache, CacheConfig, CacheHooks, CacheKey, DiskConfig, FsStorage, MemoryConfig,
    MigrationHooks, WriteMode,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Two-tier artifact cache over a local directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache location
    #[arg(long, env = "TIERCACHE_DIR", default_value = ".tiercache")]
    dir: PathBuf,

    /// On-disk format version expected by this build
    #[arg(long, env = "TIERCACHE_FORMAT_VERSION", default_value = "1")]
    format_version: String,

    /// Keep entries stamped with a different format version instead of discarding them
    #[arg(long, env = "TIERCACHE_REUSE_MISMATCHED")]
    reuse_mismatched: bool,

    /// Memory tier capacity in bytes
    #[arg(long, env = "TIERCACHE_MEMORY_CAPACITY", default_value_t = tiercache::cache::DEFAULT_MEMORY_CAPACITY)]
    memory_capacity: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a value to stdout; exits 1 on a miss
    Get { key: String },
    /// Store a value read from a file, or from stdin when no file is given
    Set { key: String, file: Option<PathBuf> },
    /// Remove a key from both tiers
    Invalidate { key: String },
    /// Remove every entry
    Clear,
    /// Show the migration outcome and metrics
    Status {
        /// Print metrics in Prometheus text format
        #[arg(long)]
        prometheus: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args);

    let backend = FsStorage::open(&args.dir)
        .await
        .with_context(|| format!("failed to open cache directory {}", args.dir.display()))?;

    let config = CacheConfig {
        memory: MemoryConfig {
            capacity: args.memory_capacity,
            ..MemoryConfig::default()
        },
        disk: DiskConfig {
            format_version: args.format_version.clone().into(),
            // A one-shot process must not exit with writes still queued
            write_mode: WriteMode::Synchronous,
            ..DiskConfig::default()
        },
        ..CacheConfig::default()
    };

    let mut migration = MigrationHooks::new();
    if args.reuse_mismatched {
        migration = migration.should_use_disk_version(|_| true);
    }
    let hooks = CacheHooks::new().with_migration(migration);

    let cache = Cache::open(config, Arc::new(backend), hooks)
        .await
        .context("failed to open cache")?;

    let code = run(&cache, args.command).await;
    cache.shutdown().await;
    code
}

async fn run(cache: &Cache, command: Command) -> Result<ExitCode> {
    match command {
        Command::Get { key } => match cache.get(&CacheKey::new(&key)).await {
            Some(payload) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&payload).context("failed to write value")?;
                stdout.flush()?;
                Ok(ExitCode::SUCCESS)
            }
            None => {
                debug!(%key, "miss");
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Set { key, file } => {
            let payload = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)
                        .context("failed to read stdin")?;
                    buf
                }
            };
            cache
                .set(key.as_str(), payload)
                .await
                .with_context(|| format!("failed to store {}", key))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Invalidate { key } => {
            let existed = cache
                .invalidate(&CacheKey::new(&key))
                .await
                .with_context(|| format!("failed to invalidate {}", key))?;
            println!("{}", if existed { "removed" } else { "absent" });
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear => {
            cache.invalidate_all().await.context("failed to clear cache")?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { prometheus } => {
            if prometheus {
                print!("{}", cache.metrics().to_prometheus()?);
                return Ok(ExitCode::SUCCESS);
            }
            let outcome = cache.migration_outcome().await.ok();
            let status = serde_json::json!({
                "format_version": cache.config().disk.format_version,
                "migration": outcome,
                "disk": cache.disk().stats(),
                "memory": cache.memory().stats(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries cache values
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
