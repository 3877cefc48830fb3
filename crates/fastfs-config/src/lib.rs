//! CLI flags and `fastfs.toml` configuration for the `fastfsd` binary.
//!
//! Layered configuration: a `clap::Parser` struct for flags/env vars, a
//! serde-derived file struct for `fastfs.toml`, and a final merge into one
//! effective `Config` with precedence CLI > env > file > default. A
//! `OnceLock` memoizes the merged config as a process-wide singleton.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no object-store bucket configured (pass --bucket or set FASTFS_BUCKET)")]
    MissingBucket,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Command-line flags for `fastfsd`. Every flag has a matching env var
/// (`FASTFS_*`) and a matching key in `fastfs.toml`; CLI wins over env,
/// which wins over the file, which wins over the built-in default.
#[derive(Debug, Parser)]
#[command(name = "fastfsd", about = "FastFS caching file system node")]
pub struct Cli {
    /// Path to a fastfs.toml file. Defaults to the platform config dir.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// S3 bucket used as the backing object store.
    #[arg(long, env = "FASTFS_BUCKET")]
    pub bucket: Option<String>,

    /// Address this node listens on.
    #[arg(long, env = "FASTFS_ADDRESS")]
    pub address: Option<String>,

    /// Membership gossip port.
    #[arg(long, env = "FASTFS_PORT")]
    pub port: Option<u16>,

    /// HTTP frontend port. Defaults to `port + 100` if unset.
    #[arg(long, env = "FASTFS_FSPORT")]
    pub fsport: Option<u16>,

    /// Seed node address to join an existing cluster.
    #[arg(long, env = "FASTFS_PRIMARY_ADDR")]
    pub primary_addr: Option<String>,

    /// Seed node membership port.
    #[arg(long, env = "FASTFS_PRIMARY_PORT")]
    pub primary_port: Option<u16>,

    /// Redis address backing the shared location index.
    #[arg(long, env = "FASTFS_REDIS_ADDR")]
    pub redis_addr: Option<String>,

    /// Number of concurrent block-download workers.
    #[arg(long, env = "FASTFS_NUM_DOWNLOADERS")]
    pub num_downloaders: Option<usize>,

    /// Block size in KiB.
    #[arg(long, env = "FASTFS_BLOCK_SIZE_KB")]
    pub block_size_kb: Option<u64>,

    /// Memory cache tier budget, in bytes.
    #[arg(long, env = "FASTFS_MEM_MAX")]
    pub mem_max: Option<u64>,

    /// Disk cache tier budget, in bytes.
    #[arg(long, env = "FASTFS_DISK_MAX")]
    pub disk_max: Option<u64>,

    /// Enable debug-level logging.
    #[arg(long, env = "FASTFS_VERBOSE")]
    pub verbose: bool,
}

/// The subset of settings that can come from `fastfs.toml`. Field names
/// match the CLI flags with dashes replaced by underscores.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    bucket: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    fsport: Option<u16>,
    primary_addr: Option<String>,
    primary_port: Option<u16>,
    redis_addr: Option<String>,
    num_downloaders: Option<usize>,
    block_size_kb: Option<u64>,
    mem_max: Option<u64>,
    disk_max: Option<u64>,
}

/// Fully resolved configuration, ready to hand to the rest of the system.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub address: String,
    pub port: u16,
    pub fsport: u16,
    pub primary_addr: Option<String>,
    pub primary_port: Option<u16>,
    pub redis_addr: String,
    pub num_downloaders: usize,
    pub block_size_kb: u64,
    pub mem_max: u64,
    pub disk_max: u64,
    pub verbose: bool,
}

const DEFAULT_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8081;
const DEFAULT_REDIS_ADDR: &str = "redis://127.0.0.1:6379";
const DEFAULT_NUM_DOWNLOADERS: usize = 8;
const DEFAULT_BLOCK_SIZE_KB: u64 = 4096;
const DEFAULT_MEM_MAX: u64 = 256 * 1024 * 1024;
const DEFAULT_DISK_MAX: u64 = 4 * 1024 * 1024 * 1024;

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fastfs").join("fastfs.toml"))
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge CLI flags over an optional `fastfs.toml` file over built-in
/// defaults.
pub fn resolve(cli: &Cli) -> Result<Config> {
    let file = match cli.config.clone().or_else(default_config_path) {
        Some(path) if path.exists() => load_file(&path)?,
        _ => FileConfig::default(),
    };

    let bucket = cli
        .bucket
        .clone()
        .or(file.bucket)
        .ok_or(ConfigError::MissingBucket)?;

    let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
    let fsport = cli.fsport.or(file.fsport).unwrap_or(port + 100);

    Ok(Config {
        bucket,
        address: cli.address.clone().or(file.address).unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
        port,
        fsport,
        primary_addr: cli.primary_addr.clone().or(file.primary_addr),
        primary_port: cli.primary_port.or(file.primary_port),
        redis_addr: cli.redis_addr.clone().or(file.redis_addr).unwrap_or_else(|| DEFAULT_REDIS_ADDR.to_string()),
        num_downloaders: cli.num_downloaders.or(file.num_downloaders).unwrap_or(DEFAULT_NUM_DOWNLOADERS),
        block_size_kb: cli.block_size_kb.or(file.block_size_kb).unwrap_or(DEFAULT_BLOCK_SIZE_KB),
        mem_max: cli.mem_max.or(file.mem_max).unwrap_or(DEFAULT_MEM_MAX),
        disk_max: cli.disk_max.or(file.disk_max).unwrap_or(DEFAULT_DISK_MAX),
        verbose: cli.verbose,
    })
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Resolve the effective config once and memoize it for the life of the
/// process. Subsequent calls return the same instance regardless of `cli`.
pub fn init(cli: &Cli) -> Result<&'static Config> {
    if let Some(existing) = CONFIG.get() {
        return Ok(existing);
    }
    let config = resolve(cli)?;
    Ok(CONFIG.get_or_init(|| config))
}

/// Install a `tracing-subscriber` with an `EnvFilter` driven by
/// `RUST_LOG`, falling back to `info` (or `debug` with `--verbose`).
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
