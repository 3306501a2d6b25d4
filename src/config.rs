//! Daemon configuration
//!
//! Options come from the command line (with environment fallbacks) and an
//! optional JSON credentials file. They are applied over defaults and
//! validated once; the resulting `Config` is immutable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::writeback::RetryPolicy;

/// Default cache quota (10 GiB)
pub const DEFAULT_QUOTA: u64 = 10 * 1024 * 1024 * 1024;

/// Default write-back queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default file permission bits for objects discovered remotely
pub const DEFAULT_MODE: u32 = 0o644;

/// Default region when the target does not need one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default interval of the cache monitor
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Mountpoint is required")]
    MissingMountpoint,

    #[error("Target URL is required")]
    MissingTarget,

    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Cache directory is required")]
    MissingCacheDir,

    #[error("Cache quota must be greater than zero")]
    ZeroQuota,

    #[error("Write-back queue capacity must be greater than zero")]
    ZeroQueueCapacity,

    #[error("Access key and secret key are required")]
    MissingCredentials,

    #[error("TLS verification cannot be disabled for {url}; use an http:// target for untrusted test servers")]
    InsecureTls { url: String },

    #[error("Failed to read credentials file {path}: {source}")]
    ReadCredentials {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse credentials file {path}: {source}")]
    ParseCredentials {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Credentials file contents (`~/.bucketfs/config.json`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub version: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Credentials {
    /// Default location of the credentials file
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".bucketfs").join("config.json"))
    }

    /// Load the credentials file; a missing file is not an error
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No credentials file");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::ReadCredentials {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let credentials =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseCredentials {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "Loaded credentials file");
        Ok(Some(credentials))
    }
}

/// Unvalidated options; `None` means "use the default"
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub target: Option<String>,
    pub mountpoint: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub quota: Option<u64>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub debug: bool,
    pub insecure: bool,
    pub allow_other: bool,
    pub queue_capacity: Option<usize>,
    pub max_retries: Option<u32>,
    pub monitor_interval: Option<Duration>,
}

impl ConfigOptions {
    /// Fill credentials missing from the command line from the file
    pub fn merge_credentials(&mut self, credentials: Credentials) {
        if self.access_key.is_none() {
            self.access_key = credentials.access_key;
        }
        if self.secret_key.is_none() {
            self.secret_key = credentials.secret_key;
        }
        if self.session_token.is_none() {
            self.session_token = credentials.session_token;
        }
    }

    /// Apply the options over defaults and validate the result
    pub fn build(self) -> Result<Config, ConfigError> {
        let mountpoint = self.mountpoint.ok_or(ConfigError::MissingMountpoint)?;
        let raw_target = self.target.ok_or(ConfigError::MissingTarget)?;
        let (target, bucket, base_path) = parse_target(&raw_target)?;
        // The S3 client always verifies certificates
        if self.insecure && target.scheme() == "https" {
            return Err(ConfigError::InsecureTls { url: raw_target });
        }

        let cache_dir = match self.cache_dir {
            Some(dir) => dir,
            None => dirs::cache_dir()
                .map(|dir| dir.join("bucketfs"))
                .ok_or(ConfigError::MissingCacheDir)?,
        };
        if cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingCacheDir);
        }

        let quota = self.quota.unwrap_or(DEFAULT_QUOTA);
        if quota == 0 {
            return Err(ConfigError::ZeroQuota);
        }

        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        let (access_key, secret_key) = match (self.access_key, self.secret_key) {
            (Some(access), Some(secret)) if !access.is_empty() && !secret.is_empty() => {
                (access, secret)
            }
            _ => return Err(ConfigError::MissingCredentials),
        };

        let mut retry = RetryPolicy::default();
        if let Some(max_retries) = self.max_retries {
            retry.max_retries = max_retries;
        }

        Ok(Config {
            cache_dir,
            quota,
            mountpoint,
            target,
            bucket,
            base_path,
            region: self.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key,
            secret_key,
            session_token: self.session_token,
            uid: self.uid.unwrap_or_else(|| unsafe { libc::getuid() }),
            gid: self.gid.unwrap_or_else(|| unsafe { libc::getgid() }),
            mode: self.mode.unwrap_or(DEFAULT_MODE) & 0o7777,
            debug: self.debug,
            insecure: self.insecure,
            allow_other: self.allow_other,
            queue_capacity,
            retry,
            monitor_interval: self.monitor_interval.unwrap_or(DEFAULT_MONITOR_INTERVAL),
        })
    }
}

/// Validated daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the local cache (payloads and `meta/`)
    pub cache_dir: PathBuf,
    /// Cache quota in bytes
    pub quota: u64,
    pub mountpoint: PathBuf,
    /// Endpoint part of the target (scheme, host, port)
    pub target: Url,
    pub bucket: String,
    /// Key prefix inside the bucket, without surrounding slashes
    pub base_path: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits for files
    pub mode: u32,
    pub debug: bool,
    pub insecure: bool,
    pub allow_other: bool,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub monitor_interval: Duration,
}

impl Config {
    /// Whether the target uses TLS
    pub fn is_secure(&self) -> bool {
        self.target.scheme() == "https"
    }

    /// Endpoint URL without bucket or path
    pub fn endpoint(&self) -> String {
        match self.target.port() {
            Some(port) => format!(
                "{}://{}:{}",
                self.target.scheme(),
                self.target.host_str().unwrap_or_default(),
                port
            ),
            None => format!(
                "{}://{}",
                self.target.scheme(),
                self.target.host_str().unwrap_or_default()
            ),
        }
    }

    /// Base path as a key prefix ("" or ending in '/')
    pub fn base_prefix(&self) -> String {
        if self.base_path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.base_path)
        }
    }

    /// Location of the metadata store
    pub fn store_path(&self) -> PathBuf {
        self.cache_dir.join("meta").join("cache.db")
    }

    /// Directory permission bits derived from the file mode
    pub fn dir_mode(&self) -> u32 {
        // Directories need search permission wherever read is granted
        self.mode | ((self.mode & 0o444) >> 2)
    }
}

/// Split `scheme://host[:port]/bucket[/base/path]`
fn parse_target(raw: &str) -> Result<(Url, String, String), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTarget {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }

    let mut segments = url
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty());
    let bucket = segments
        .next()
        .ok_or_else(|| invalid("missing bucket"))?
        .to_string();
    let base_path = segments.collect::<Vec<_>>().join("/");

    Ok((url, bucket, base_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(target: &str) -> ConfigOptions {
        ConfigOptions {
            target: Some(target.to_string()),
            mountpoint: Some(PathBuf::from("/mnt/data")),
            cache_dir: Some(PathBuf::from("/var/cache/bucketfs")),
            access_key: Some("AKIA".into()),
            secret_key: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = options("https://s3.example.com/photos").build().unwrap();

        assert_eq!(config.bucket, "photos");
        assert_eq!(config.base_path, "");
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.quota, DEFAULT_QUOTA);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.mode, DEFAULT_MODE);
        assert_eq!(config.dir_mode(), 0o755);
        assert!(config.is_secure());
        assert_eq!(config.endpoint(), "https://s3.example.com");
        assert_eq!(
            config.store_path(),
            PathBuf::from("/var/cache/bucketfs/meta/cache.db")
        );
    }

    #[test]
    fn test_target_with_port_and_base_path() {
        let config = options("http://127.0.0.1:9000/bucket/a/b/").build().unwrap();

        assert!(!config.is_secure());
        assert_eq!(config.endpoint(), "http://127.0.0.1:9000");
        assert_eq!(config.bucket, "bucket");
        assert_eq!(config.base_path, "a/b");
        assert_eq!(config.base_prefix(), "a/b/");
    }

    #[test]
    fn test_invalid_targets_rejected() {
        for target in ["ftp://host/bucket", "http://host", "http://host/", "not a url"] {
            let err = options(target).build().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidTarget { .. }),
                "{} gave {:?}",
                target,
                err
            );
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut opts = options("http://host/b");
        opts.quota = Some(0);
        assert!(matches!(opts.build(), Err(ConfigError::ZeroQuota)));

        let mut opts = options("http://host/b");
        opts.queue_capacity = Some(0);
        assert!(matches!(opts.build(), Err(ConfigError::ZeroQueueCapacity)));

        let mut opts = options("http://host/b");
        opts.secret_key = None;
        assert!(matches!(opts.build(), Err(ConfigError::MissingCredentials)));

        let mut opts = options("http://host/b");
        opts.mountpoint = None;
        assert!(matches!(opts.build(), Err(ConfigError::MissingMountpoint)));
    }

    #[test]
    fn test_insecure_only_with_plain_http() {
        let mut opts = options("https://s3.example.com/b");
        opts.insecure = true;
        assert!(matches!(opts.build(), Err(ConfigError::InsecureTls { .. })));

        let mut opts = options("http://127.0.0.1:9000/b");
        opts.insecure = true;
        let config = opts.build().unwrap();
        assert!(config.insecure);
        assert!(!config.is_secure());
    }

    #[test]
    fn test_credentials_file_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"version":"1","accessKey":"file-access","secretKey":"file-secret","sessionToken":"tok"}"#,
        )
        .unwrap();

        let mut opts = options("http://host/b");
        opts.secret_key = None;
        opts.merge_credentials(Credentials::load(&path).unwrap().unwrap());
        let config = opts.build().unwrap();

        // Command line wins over the file
        assert_eq!(config.access_key, "AKIA");
        assert_eq!(config.secret_key, "file-secret");
        assert_eq!(config.session_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_missing_credentials_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Credentials::load(&dir.path().join("absent.json"))
            .unwrap()
            .is_none());
    }
}
