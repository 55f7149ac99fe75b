use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

/// Durable blob storage.
///
/// Implementations are shared by camera workers, so every call must be safe
/// to make concurrently and each put must be all-or-nothing.
pub trait ObjectStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    fn make_bucket(&self, bucket: &str) -> Result<()>;

    fn put_object(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// URL under which a stored object is publicly readable.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
struct Buckets {
    buckets: HashSet<String>,
    objects: HashMap<(String, String), StoredObject>,
    unreachable: bool,
}

/// Object store kept in process memory. Clones share contents.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    inner: Arc<Mutex<Buckets>>,
}

impl InMemoryObjectStore {
    pub const BASE_URL: &'static str = "memory://objects";

    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unreachable = unreachable;
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.inner
            .lock()
            .ok()?
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().map(|i| i.objects.len()).unwrap_or(0)
    }

    /// Resolve a URL produced by `public_url` back to its object bytes.
    pub fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        let path = url
            .strip_prefix(Self::BASE_URL)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| anyhow!("url {} is not served by this store", url))?;
        let (bucket, key) = path
            .split_once('/')
            .ok_or_else(|| anyhow!("url {} has no object key", url))?;
        self.get_object(bucket, key)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Buckets>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?;
        if inner.unreachable {
            return Err(anyhow!("object store unreachable"));
        }
        Ok(inner)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.lock()?.buckets.contains(bucket))
    }

    fn make_bucket(&self, bucket: &str) -> Result<()> {
        self.lock()?.buckets.insert(bucket.to_string());
        Ok(())
    }

    fn put_object(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.buckets.contains(bucket) {
            return Err(anyhow!("bucket {} does not exist", bucket));
        }
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.lock()?
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| anyhow!("object {}/{} not found", bucket, key))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", Self::BASE_URL, bucket, key)
    }
}
