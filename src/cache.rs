use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::ETAG;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::BoxError;
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

pub const CACHE_KEY_PREFIX: &str = "etagRequest-";

/// `etagRequest-` + base64(sha1(url)), over the url text exactly as given.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_url(url: &str) -> Self {
        let digest = Sha1::digest(url.as_bytes());
        Self(format!("{CACHE_KEY_PREFIX}{}", STANDARD.encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A stored response: lower-cased header names and the raw body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
}

impl CacheEntry {
    pub fn new(headers: BTreeMap<String, String>, data: impl Into<Bytes>) -> Self {
        Self {
            headers,
            data: data.into(),
        }
    }

    pub fn from_response(response: &HttpResponse) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_owned())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        Self {
            headers,
            data: response.body().clone(),
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers
            .get(ETAG.as_str())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BoxError>;

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), BoxError>;
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.entries).is_empty()
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        lock_unpoisoned(&self.entries).remove(key)
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BoxError> {
        Ok(lock_unpoisoned(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), BoxError> {
        lock_unpoisoned(&self.entries).insert(key.to_owned(), entry);
        Ok(())
    }
}
