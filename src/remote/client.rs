//! S3-compatible object store client
//!
//! `RemoteStore` is the narrow surface the rest of the daemon consumes;
//! `S3Remote` implements it with aws-sdk-s3 against any S3-compatible
//! endpoint (AWS, MinIO, Ceph RGW, ...).

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::Client;
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::errors::RemoteError;
use super::types::{Listing, ObjectInfo};
use crate::config::Config;

/// Connection establishment timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed between bytes of a response
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Upper bound for a single request attempt
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Page size for listings
const LIST_PAGE_SIZE: i32 = 1000;

/// Operations the daemon needs from the object store.
///
/// Keys are relative to the mount root; implementations add any bucket-level
/// prefix themselves.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Download the full object
    async fn get(&self, key: &str) -> Result<Vec<u8>, RemoteError>;

    /// Object metadata, or `None` if the key does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, RemoteError>;

    /// Upload `data` as the full content of `key`
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), RemoteError>;

    /// Server-side copy
    async fn copy(&self, source: &str, destination: &str) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// List keys under `prefix`; with `delimited` only direct children are
    /// returned and deeper keys are folded into common prefixes.
    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        limit: Option<usize>,
    ) -> Result<Listing, RemoteError>;
}

/// aws-sdk-s3 backed remote store
pub struct S3Remote {
    client: Client,
    bucket: String,
    /// Key prefix inside the bucket ("" or ending in '/')
    base: String,
}

impl S3Remote {
    /// Build a client for the configured target. No request is made here.
    pub fn new(config: &Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            config.session_token.clone(),
            None,
            "bucketfs",
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .operation_attempt_timeout(ATTEMPT_TIMEOUT)
            .build();

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .timeout_config(timeouts)
            .build();

        info!(
            endpoint = %config.endpoint(),
            bucket = %config.bucket,
            secure = config.is_secure(),
            "S3 client ready"
        );

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            base: config.base_prefix(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.base.as_str()).unwrap_or(key)
    }

    fn object_info(
        &self,
        key: &str,
        size: Option<i64>,
        etag: Option<&str>,
        modified: Option<&DateTime>,
    ) -> ObjectInfo {
        ObjectInfo {
            key: self.relative_key(key).to_string(),
            size: size.unwrap_or(0).max(0) as u64,
            etag: etag.map(str::to_string),
            last_modified: modified.and_then(|t| SystemTime::try_from(*t).ok()),
        }
    }
}

/// Base64 SHA-1 digest as expected by the x-amz-checksum-sha1 header
fn sha1_checksum(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[async_trait]
impl RemoteStore for S3Remote {
    async fn get(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        debug!(key = key, "Downloading object");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(RemoteError::from_sdk)?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let data = body.into_bytes().to_vec();
        info!(key = key, size = data.len(), "Downloaded object");
        Ok(data)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, RemoteError> {
        let full = self.full_key(key);
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full)
            .send()
            .await
            .map_err(RemoteError::from_sdk);

        match result {
            Ok(output) => Ok(Some(self.object_info(
                &full,
                output.content_length(),
                output.e_tag(),
                output.last_modified(),
            ))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), RemoteError> {
        let checksum = sha1_checksum(&data);
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .checksum_sha1(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(RemoteError::from_sdk)?;

        info!(key = key, size = size, "Uploaded object");
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), RemoteError> {
        let copy_source = format!(
            "{}/{}",
            self.bucket,
            urlencoding::encode(&self.full_key(source))
        );

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source)
            .key(self.full_key(destination))
            .send()
            .await
            .map_err(RemoteError::from_sdk)?;

        info!(source = source, destination = destination, "Copied object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(RemoteError::from_sdk)?;

        info!(key = key, "Deleted object");
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        limit: Option<usize>,
    ) -> Result<Listing, RemoteError> {
        let full_prefix = self.full_key(prefix);
        let mut listing = Listing::default();
        let mut token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .max_keys(LIST_PAGE_SIZE)
                .set_continuation_token(token.take());
            if delimited {
                request = request.delimiter("/");
            }

            debug!(prefix = %full_prefix, delimited = delimited, "Listing objects");
            let output = request.send().await.map_err(RemoteError::from_sdk)?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                listing.objects.push(self.object_info(
                    key,
                    object.size(),
                    object.e_tag(),
                    object.last_modified(),
                ));
            }
            for common in output.common_prefixes() {
                if let Some(p) = common.prefix() {
                    listing.prefixes.push(self.relative_key(p).to_string());
                }
            }

            let reached_limit = limit
                .is_some_and(|max| listing.objects.len() + listing.prefixes.len() >= max);
            match output.next_continuation_token() {
                Some(next) if output.is_truncated() == Some(true) && !reached_limit => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }

        debug!(
            prefix = %full_prefix,
            objects = listing.objects.len(),
            prefixes = listing.prefixes.len(),
            "Listed objects"
        );
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOptions;

    fn remote_for(target: &str) -> S3Remote {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigOptions {
            target: Some(target.to_string()),
            mountpoint: Some(dir.path().to_path_buf()),
            cache_dir: Some(dir.path().join("cache")),
            access_key: Some("access".into()),
            secret_key: Some("secret".into()),
            ..Default::default()
        }
        .build()
        .unwrap();
        S3Remote::new(&config)
    }

    #[test]
    fn test_keys_mapped_under_base_path() {
        let remote = remote_for("http://localhost:9000/photos/2024/trip");

        assert_eq!(remote.bucket, "photos");
        assert_eq!(remote.full_key("a.jpg"), "2024/trip/a.jpg");
        assert_eq!(remote.relative_key("2024/trip/sub/"), "sub/");
    }

    #[test]
    fn test_keys_without_base_path() {
        let remote = remote_for("https://s3.example.com/data");

        assert_eq!(remote.full_key("dir/file"), "dir/file");
        assert_eq!(remote.relative_key("dir/file"), "dir/file");
    }

    #[test]
    fn test_sha1_checksum_is_base64() {
        // sha1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(sha1_checksum(b"abc"), "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
    }
}
