//! Cache API: named, versioned buckets of request → response snapshots.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache ("proscool-v1")
//!             └── CacheKey (method + URL) → CacheEntry
//! ```

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Entries ====================

/// Identity a snapshot is stored under: method plus URL, fragment stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Request method, upper case.
    pub method: String,

    /// Request URL without fragment.
    pub url: String,
}

impl CacheKey {
    /// Create a key for `method` and `url`.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Create a key for a GET request.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    #[serde(default)]
    pub status_text: String,

    /// Response headers, repeated names included.
    #[serde(with = "header_pairs")]
    pub headers: HeaderMap,

    /// Response body, kept opaque.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Headers as ordered `[name, value]` pairs, so repeated names survive.
mod header_pairs {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&str, String)> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let pairs = Vec::<(String, String)>::deserialize(deserializer)?;
        let mut headers = HeaderMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(D::Error::custom)?;
            let value = HeaderValue::from_str(&value).map_err(D::Error::custom)?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

// ==================== Cache ====================

/// A cache bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name (the version tag).
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a snapshot, replacing any previous one under the same key.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        check_storable(&key, &entry)?;
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Store several snapshots. Nothing is written unless every one is storable.
    pub fn put_all(
        &mut self,
        snapshots: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        for (key, entry) in &snapshots {
            check_storable(key, entry)?;
        }
        self.entries.extend(snapshots);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_storable(key: &CacheKey, entry: &CacheEntry) -> Result<(), ServiceWorkerError> {
    if key.method != "GET" {
        return Err(ServiceWorkerError::CacheError(format!(
            "cannot store {} request for {}",
            key.method, key.url
        )));
    }
    if entry.status == 206 {
        return Err(ServiceWorkerError::CacheError(format!(
            "cannot store partial response for {}",
            key.url
        )));
    }
    Ok(())
}

// ==================== Cache Storage ====================

/// Cache storage (caches global), shared by every controlled page.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,

    /// Creation order; lookups across buckets follow it.
    order: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    name: String,
    entries: Vec<CacheEntry>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = name, "Creating cache");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache for writing without creating it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Delete a cache. Returns false if there was none.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches, oldest first.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(key))
    }

    /// Serialize every bucket to JSON.
    pub fn to_json(&self) -> Result<String, ServiceWorkerError> {
        let persisted: Vec<PersistedCache> = self
            .order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .map(|cache| PersistedCache {
                name: cache.name.clone(),
                entries: cache.entries.values().cloned().collect(),
            })
            .collect();
        serde_json::to_string(&persisted).map_err(|e| ServiceWorkerError::Storage(e.to_string()))
    }

    /// Rebuild storage from [`CacheStorage::to_json`] output.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let persisted: Vec<PersistedCache> =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::Storage(e.to_string()))?;

        let mut storage = Self::new();
        for bucket in persisted {
            let cache = storage.open(&bucket.name);
            for entry in bucket.entries {
                cache.entries.insert(entry.key(), entry);
            }
        }
        Ok(storage)
    }

    /// Write every bucket to `path`.
    ///
    /// The snapshot goes to a sibling temp file first and is renamed into
    /// place, so an interrupted save leaves the previous file intact.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ServiceWorkerError> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let tmp = temp_path(path);

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ServiceWorkerError::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ServiceWorkerError::Storage(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), caches = self.order.len(), "Cache storage saved");
        Ok(())
    }

    /// Read storage written by [`CacheStorage::save`]. A missing file is empty storage.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let storage = Self::from_json(&json)?;
                info!(path = %path.display(), caches = storage.order.len(), "Cache storage loaded");
                Ok(storage)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved cache storage");
                Ok(Self::new())
            }
            Err(e) => Err(ServiceWorkerError::Storage(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
