//! In-memory remote store for tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::client::RemoteStore;
use super::errors::RemoteError;
use super::types::{Listing, ObjectInfo};

/// Remote store double that records every call
#[derive(Default)]
pub struct MemoryRemote {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    gets: AtomicUsize,
    /// Queued failures per operation name, returned before touching state
    failures: Mutex<HashMap<&'static str, Vec<RemoteError>>>,
    get_delay: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Make the next call(s) of `op` fail with the given errors, in order
    pub fn fail_next(&self, op: &'static str, errors: Vec<RemoteError>) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(op).or_default();
        // Stored reversed so pop() yields them in the given order
        for e in errors {
            queue.insert(0, e);
        }
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    fn begin(&self, op: &'static str, detail: String) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, detail));
        match self.failures.lock().unwrap().get_mut(op).and_then(Vec::pop) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn info(key: &str, data: &[u8]) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            etag: Some(format!("\"{:x}\"", data.len())),
            last_modified: None,
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        self.begin("get", key.to_string())?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.object(key)
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, RemoteError> {
        self.begin("head", key.to_string())?;
        Ok(self.object(key).map(|data| Self::info(key, &data)))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), RemoteError> {
        self.begin("put", key.to_string())?;
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), RemoteError> {
        self.begin("copy", format!("{}->{}", source, destination))?;
        let data = self
            .object(source)
            .ok_or_else(|| RemoteError::NotFound(source.to_string()))?;
        self.objects
            .lock()
            .unwrap()
            .insert(destination.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.begin("delete", key.to_string())?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        limit: Option<usize>,
    ) -> Result<Listing, RemoteError> {
        self.begin("list", prefix.to_string())?;
        let objects = self.objects.lock().unwrap();
        let mut listing = Listing::default();

        for (key, data) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if limit.is_some_and(|max| listing.objects.len() + listing.prefixes.len() >= max) {
                break;
            }
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                Some(slash) if delimited => {
                    let common = format!("{}{}", prefix, &rest[..=slash]);
                    if listing.prefixes.last() != Some(&common) {
                        listing.prefixes.push(common);
                    }
                }
                _ => listing.objects.push(Self::info(key, data)),
            }
        }

        Ok(listing)
    }
}
