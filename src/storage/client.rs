// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Façade over the adapter set and mirror registry: picks a mirror, issues
//! the request, rotates on transient failure, and caches HEAD responses.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{FetchError, FetchResult};
use crate::storage::adapter::{Adapter, ByteStream, Head, Want};
use crate::storage::mirror::MirrorRegistry;

struct CachedHead {
    head: Head,
    expires_at: Instant,
}

/// One entry of the resolved-mirror cache: which physical URL last served a
/// logical URL successfully, and until when that pick should be reused
/// instead of re-rolling the random choice.
struct CachedResolution {
    physical: String,
    expires_at: Instant,
}

/// Bound on distinct logical URLs kept in the HEAD cache. Generous enough
/// that a single run never evicts an entry still within its TTL in practice.
const HEAD_CACHE_CAPACITY: usize = 1024;
const RESOLVE_CACHE_CAPACITY: usize = 1024;

/// Façade the Transfer and Supervisor use to reach remote storage.
pub struct Client {
    adapters: Vec<Box<dyn Adapter>>,
    mirrors: RwLock<MirrorRegistry>,
    head_cache: Mutex<LruCache<String, CachedHead>>,
    resolve_cache: Mutex<LruCache<String, CachedResolution>>,
    head_ttl: Duration,
    resolve_ttl: Duration,
    max_retries: usize,
}

impl Client {
    pub fn new(adapters: Vec<Box<dyn Adapter>>, config: &Config) -> Self {
        let mut mirrors = MirrorRegistry::new(config.random_seed);
        mirrors.load_files(&config.mirror_files);
        Self {
            adapters,
            mirrors: RwLock::new(mirrors),
            head_cache: Mutex::new(LruCache::new(NonZeroUsize::new(HEAD_CACHE_CAPACITY).unwrap())),
            resolve_cache: Mutex::new(LruCache::new(NonZeroUsize::new(RESOLVE_CACHE_CAPACITY).unwrap())),
            head_ttl: Duration::from_secs_f64(config.head_ttl_secs),
            resolve_ttl: Duration::from_secs_f64(config.resolve_ttl_secs),
            max_retries: config.max_retries,
        }
    }

    fn adapter_for(&self, url: &str) -> FetchResult<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|a| a.match_url(url))
            .map(|a| a.as_ref())
            .ok_or_else(|| FetchError::UnsupportedUrl(url.to_string()))
    }

    /// HEAD, cached for `head_ttl`, keyed by logical URL. Rotates mirrors on
    /// transient failure, bounded by `max_retries`.
    pub async fn head(&self, logical_url: &str) -> FetchResult<Head> {
        if let Some(cached) = self.head_cache.lock().get(logical_url) {
            if Instant::now() < cached.expires_at {
                return Ok(cached.head.clone());
            }
        }

        let head = self.with_mirror_rotation(logical_url, |adapter, physical| {
            let physical = physical.to_string();
            Box::pin(async move { adapter.head(&physical).await })
        })
        .await?;

        self.head_cache.lock().put(
            logical_url.to_string(),
            CachedHead {
                head: head.clone(),
                expires_at: Instant::now() + self.head_ttl,
            },
        );

        Ok(head)
    }

    /// GET with an optional range. On stream failure mid-body the caller receives
    /// the error and is responsible for replanning the remaining sub-range.
    pub async fn get(&self, logical_url: &str, want: Want, chunk_size: usize) -> FetchResult<(Head, ByteStream)> {
        self.with_mirror_rotation(logical_url, move |adapter, physical| {
            let physical = physical.to_string();
            Box::pin(async move { adapter.get(&physical, want, chunk_size).await })
        })
        .await
    }

    async fn with_mirror_rotation<T, F>(&self, logical_url: &str, op: F) -> FetchResult<T>
    where
        F: for<'a> Fn(
            &'a dyn Adapter,
            &'a str,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FetchResult<T>> + Send + 'a>>,
    {
        let adapter = self.adapter_for(logical_url)?;
        let mut tried = Vec::new();
        let mut last_err: Option<FetchError> = None;

        for attempt in 0..self.max_retries.max(1) {
            let cached = if attempt == 0 {
                self.resolve_cache.lock().get(logical_url).and_then(|c| {
                    if Instant::now() < c.expires_at {
                        Some(c.physical.clone())
                    } else {
                        None
                    }
                })
            } else {
                None
            };

            let physical = match cached {
                Some(url) => url,
                None => {
                    let mut mirrors = self.mirrors.write().await;
                    match mirrors.choose_excluding(logical_url, &tried) {
                        Some(url) => url,
                        None if tried.is_empty() => mirrors.choose(logical_url),
                        None => break,
                    }
                }
            };

            match op(adapter, &physical).await {
                Ok(value) => {
                    self.mirrors.write().await.record_success(&physical);
                    self.resolve_cache.lock().put(
                        logical_url.to_string(),
                        CachedResolution {
                            physical,
                            expires_at: Instant::now() + self.resolve_ttl,
                        },
                    );
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    self.mirrors.write().await.record_failure(&physical);
                    self.resolve_cache.lock().pop(logical_url);
                    tried.push(physical);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Transient {
            url: logical_url.to_string(),
            message: "no mirror available".into(),
        }))
    }

    /// Called by the Supervisor on each tick: evicts expired HEAD and resolved-
    /// mirror cache entries, and reaps resolved mirror cooldowns.
    pub async fn monitor(&self) {
        let now = Instant::now();
        {
            let mut cache = self.head_cache.lock();
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, cached)| cached.expires_at <= now)
                .map(|(url, _)| url.clone())
                .collect();
            for url in expired {
                cache.pop(&url);
            }
        }
        {
            let mut cache = self.resolve_cache.lock();
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, cached)| cached.expires_at <= now)
                .map(|(url, _)| url.clone())
                .collect();
            for url in expired {
                cache.pop(&url);
            }
        }
        self.mirrors.write().await.reap_expired_cooldowns();
    }
}

/// Build the default adapter chain: S3 before HTTP, so `s3://` URLs never fall
/// through to the generic HTTP matcher.
pub fn default_adapters() -> Vec<Box<dyn Adapter>> {
    let http_client = reqwest::Client::new();
    vec![
        Box::new(crate::storage::adapter::S3Adapter::new(http_client.clone(), "us-east-1")),
        Box::new(crate::storage::adapter::HTTPAdapter::new(http_client)),
    ]
}

pub type SharedClient = Arc<Client>;
