use crate::services::{
    lifecycle::LifecycleConfig, policy::DenylistPolicy, reaper::ReaperConfig, retry::RetryPolicy,
};
use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "TRANSFER_RELAY_";

const DEFAULT_DENIED_EXTENSIONS: &str = ".exe,.dll,.sh,.bat";
const DEFAULT_DENIED_CONTENT_TYPES: &str = "application/x-msdownload,application/x-msdos-program";

/// Upper bound for every hour/second setting; keeps time arithmetic in range.
const MAX_HOURS: i64 = 24 * 365 * 10;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; flags win.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Prefix for download links, e.g. `https://files.example.com`.
    pub public_base_url: Option<String>,
    pub min_ttl_hours: i64,
    pub max_ttl_hours: i64,
    pub max_file_size_mb: u64,
    pub denied_extensions: Vec<String>,
    pub denied_content_types: Vec<String>,
    pub reaper_interval_secs: u64,
    pub reaper_batch_size: usize,
    pub pending_timeout_secs: u64,
    pub tombstone_retention_hours: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Temporary file transfer relay")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded files are stored (overrides TRANSFER_RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TRANSFER_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL used in returned download links (overrides TRANSFER_RELAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Shortest allowed expiry in hours (overrides TRANSFER_RELAY_MIN_TTL_HOURS)
    #[arg(long)]
    pub min_ttl_hours: Option<i64>,

    /// Longest allowed expiry in hours (overrides TRANSFER_RELAY_MAX_TTL_HOURS)
    #[arg(long)]
    pub max_ttl_hours: Option<i64>,

    /// Upload size limit in MiB (overrides TRANSFER_RELAY_MAX_FILE_SIZE_MB)
    #[arg(long)]
    pub max_file_size_mb: Option<u64>,

    /// Comma-separated extension denylist (overrides TRANSFER_RELAY_DENIED_EXTENSIONS)
    #[arg(long)]
    pub denied_extensions: Option<String>,

    /// Comma-separated content-type denylist (overrides TRANSFER_RELAY_DENIED_CONTENT_TYPES)
    #[arg(long)]
    pub denied_content_types: Option<String>,

    /// Seconds between reaper sweeps (overrides TRANSFER_RELAY_REAPER_INTERVAL_SECS)
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Records handled per reaper batch (overrides TRANSFER_RELAY_REAPER_BATCH_SIZE)
    #[arg(long)]
    pub reaper_batch_size: Option<usize>,

    /// Age at which an uncommitted upload is reclaimed (overrides TRANSFER_RELAY_PENDING_TIMEOUT_SECS)
    #[arg(long)]
    pub pending_timeout_secs: Option<u64>,

    /// How long deleted transfers are remembered (overrides TRANSFER_RELAY_TOMBSTONE_RETENTION_HOURS)
    #[arg(long)]
    pub tombstone_retention_hours: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over values read through `lookup`, then validate.
    fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_string = |name: &str, default: &str| -> Result<String> {
            env_value(&lookup, name, default.to_string())
        };

        let public_base_url = match args.public_base_url {
            Some(url) => Some(url),
            None => match lookup(&format!("{ENV_PREFIX}PUBLIC_BASE_URL")) {
                Ok(url) => Some(url),
                Err(env::VarError::NotPresent) => None,
                Err(err) => return Err(err).context("reading TRANSFER_RELAY_PUBLIC_BASE_URL"),
            },
        }
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());

        let denied_extensions = match args.denied_extensions {
            Some(list) => list,
            None => env_string("DENIED_EXTENSIONS", DEFAULT_DENIED_EXTENSIONS)?,
        };
        let denied_content_types = match args.denied_content_types {
            Some(list) => list,
            None => env_string("DENIED_CONTENT_TYPES", DEFAULT_DENIED_CONTENT_TYPES)?,
        };

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_string("HOST", "0.0.0.0")?,
            },
            port: or_env(args.port, &lookup, "PORT", 3000)?,
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_string("STORAGE_DIR", "./data/objects")?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_string("DATABASE_URL", "sqlite://./data/meta/transfer_relay.db")?,
            },
            public_base_url,
            min_ttl_hours: or_env(args.min_ttl_hours, &lookup, "MIN_TTL_HOURS", 1)?,
            max_ttl_hours: or_env(args.max_ttl_hours, &lookup, "MAX_TTL_HOURS", 168)?,
            max_file_size_mb: or_env(args.max_file_size_mb, &lookup, "MAX_FILE_SIZE_MB", 100)?,
            denied_extensions: parse_list(&denied_extensions),
            denied_content_types: parse_list(&denied_content_types),
            reaper_interval_secs: or_env(
                args.reaper_interval_secs,
                &lookup,
                "REAPER_INTERVAL_SECS",
                300,
            )?,
            reaper_batch_size: or_env(args.reaper_batch_size, &lookup, "REAPER_BATCH_SIZE", 100)?,
            pending_timeout_secs: or_env(
                args.pending_timeout_secs,
                &lookup,
                "PENDING_TIMEOUT_SECS",
                3600,
            )?,
            tombstone_retention_hours: or_env(
                args.tombstone_retention_hours,
                &lookup,
                "TOMBSTONE_RETENTION_HOURS",
                168,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.min_ttl_hours >= 1, "min_ttl_hours must be at least 1");
        ensure!(
            self.max_ttl_hours >= self.min_ttl_hours,
            "max_ttl_hours ({}) is below min_ttl_hours ({})",
            self.max_ttl_hours,
            self.min_ttl_hours
        );
        ensure!(self.max_file_size_mb >= 1, "max_file_size_mb must be at least 1");
        ensure!(self.reaper_interval_secs >= 1, "reaper_interval_secs must be at least 1");
        ensure!(self.reaper_batch_size >= 1, "reaper_batch_size must be at least 1");
        ensure!(self.pending_timeout_secs >= 1, "pending_timeout_secs must be at least 1");
        ensure!(
            self.max_ttl_hours <= MAX_HOURS,
            "max_ttl_hours must not exceed {MAX_HOURS}"
        );
        ensure!(
            (0..=MAX_HOURS).contains(&self.tombstone_retention_hours),
            "tombstone_retention_hours must be between 0 and {MAX_HOURS}"
        );
        ensure!(
            self.pending_timeout_secs <= MAX_HOURS as u64 * 3600,
            "pending_timeout_secs must not exceed {} hours",
            MAX_HOURS
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            min_ttl_hours: self.min_ttl_hours,
            max_ttl_hours: self.max_ttl_hours,
            pending_timeout: chrono::Duration::seconds(self.pending_timeout_secs as i64),
            retry: RetryPolicy::default(),
            ..LifecycleConfig::default()
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs),
            tombstone_retention: chrono::Duration::hours(self.tombstone_retention_hours),
            batch_size: self.reaper_batch_size,
        }
    }

    pub fn upload_policy(&self) -> DenylistPolicy {
        DenylistPolicy::new(&self.denied_extensions, &self.denied_content_types)
    }
}

/// Read `TRANSFER_RELAY_{name}`, falling back to `default` when unset.
fn env_value<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{name}");
    match lookup(&key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

fn or_env<F, T>(flag: Option<T>, lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match flag {
        Some(value) => Ok(value),
        None => env_value(lookup, name, default),
    }
}

/// Split a comma-separated setting, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
