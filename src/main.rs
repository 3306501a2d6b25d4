//! bucketfs - mount an S3-compatible bucket as a local filesystem
//!
//! Reads are served from a local cache populated on first open; writes land in
//! the cache and are pushed to the bucket asynchronously in the background.

mod cache;
mod config;
mod fs;
mod lock;
mod meta;
mod mount;
mod remote;
mod session;
mod writeback;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{ConfigOptions, Credentials};
use mount::Controller;

/// Command line, with environment fallbacks for every option
#[derive(Parser, Debug)]
#[command(name = "bucketfs", version, about)]
struct Cli {
    /// Bucket URL: http(s)://host[:port]/bucket[/base/path]
    #[arg(env = "BUCKETFS_TARGET")]
    target: String,

    /// Directory to mount the bucket on
    #[arg(env = "BUCKETFS_MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Local cache directory [default: user cache dir]
    #[arg(long, env = "BUCKETFS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Cache quota, e.g. 512M or 10G [default: 10G]
    #[arg(long, env = "BUCKETFS_QUOTA", value_parser = parse_size)]
    quota: Option<u64>,

    #[arg(long, env = "BUCKETFS_REGION")]
    region: Option<String>,

    #[arg(long, env = "BUCKETFS_ACCESS_KEY")]
    access_key: Option<String>,

    #[arg(long, env = "BUCKETFS_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    #[arg(long, env = "BUCKETFS_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Owner of all files [default: current user]
    #[arg(long, env = "BUCKETFS_UID")]
    uid: Option<u32>,

    /// Group of all files [default: current group]
    #[arg(long, env = "BUCKETFS_GID")]
    gid: Option<u32>,

    /// Octal permission bits for files [default: 644]
    #[arg(long, env = "BUCKETFS_MODE", value_parser = parse_mode)]
    mode: Option<u32>,

    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(long, env = "BUCKETFS_DEBUG")]
    debug: bool,

    /// Untrusted test server; only accepted with an http:// target
    #[arg(long, env = "BUCKETFS_INSECURE")]
    insecure: bool,

    /// Let other users access the mount
    #[arg(long, env = "BUCKETFS_ALLOW_OTHER")]
    allow_other: bool,

    /// Maximum queued write-back operations
    #[arg(long, env = "BUCKETFS_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Retries for transient remote errors
    #[arg(long, env = "BUCKETFS_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Seconds between cache monitor passes
    #[arg(long, env = "BUCKETFS_MONITOR_INTERVAL")]
    monitor_interval: Option<u64>,

    /// Credentials file [default: ~/.bucketfs/config.json]
    #[arg(long, env = "BUCKETFS_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_options(self) -> Result<ConfigOptions> {
        let credentials_path = self.config.clone().or_else(Credentials::default_path);

        let mut options = ConfigOptions {
            target: Some(self.target),
            mountpoint: Some(self.mountpoint),
            cache_dir: self.cache_dir,
            quota: self.quota,
            region: self.region,
            access_key: self.access_key,
            secret_key: self.secret_key,
            session_token: self.session_token,
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
            debug: self.debug,
            insecure: self.insecure,
            allow_other: self.allow_other,
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            monitor_interval: self.monitor_interval.map(Duration::from_secs),
        };

        if let Some(path) = credentials_path {
            if let Some(credentials) = Credentials::load(&path)? {
                options.merge_credentials(credentials);
            }
        }
        Ok(options)
    }
}

/// Parse a byte count with an optional K/M/G/T suffix (powers of 1024)
fn parse_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, shift) = match raw.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(format!("unknown size suffix '{}'", c)),
            };
            (&raw[..i], shift)
        }
        _ => (raw, 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", raw, e))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' is too large", raw))
}

fn parse_mode(raw: &str) -> Result<u32, String> {
    let digits = raw.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode '{}'", raw))
}

fn init_logging(debug: bool) -> Result<()> {
    let default_filter = if debug { "bucketfs=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(debug)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let options = cli.into_options().context("Failed to load credentials")?;
    let mut controller = Controller::new();
    controller.run(options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("10g").unwrap(), 10 * 1024 * 1024 * 1024);
        assert!(parse_size("10X").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("0o750").unwrap(), 0o750);
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn test_cli_maps_to_options() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "bucketfs",
            "https://s3.example.com/photos/2024",
            "/mnt/photos",
            "--quota",
            "1G",
            "--mode",
            "600",
            "--access-key",
            "AK",
            "--secret-key",
            "SK",
            "--monitor-interval",
            "5",
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
        ])
        .unwrap();

        let config = cli.into_options().unwrap().build().unwrap();
        assert_eq!(config.bucket, "photos");
        assert_eq!(config.base_path, "2024");
        assert_eq!(config.quota, 1024 * 1024 * 1024);
        assert_eq!(config.mode, 0o600);
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.access_key, "AK");
    }
}
