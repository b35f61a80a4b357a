use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use http::Method;
use tokio::sync::{Mutex, MutexGuard};

use crate::constants::CACHE_BUCKETS;
use crate::message::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Hit,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    response: Response,
    created_at: Instant,
    ttl: Duration,
}

type Bucket = HashMap<String, CacheEntry>;
pub type BucketGuard<'a> = MutexGuard<'a, Bucket>;

/// Response cache split into a fixed array of independently lockable
/// buckets. A bucket's guard doubles as the mutual-exclusion token the
/// request orchestrator holds across an origin round trip, so concurrent
/// duplicate requests coalesce into one fetch.
#[derive(Debug)]
pub struct HttpCache {
    buckets: Vec<Mutex<Bucket>>,
    max_age: RwLock<Option<Duration>>,
}

impl Default for HttpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCache {
    pub fn new() -> Self {
        Self {
            buckets: (0..CACHE_BUCKETS).map(|_| Mutex::new(Bucket::new())).collect(),
            max_age: RwLock::new(None),
        }
    }

    /// Deterministic bucket index for a request. Hash collisions make
    /// unrelated requests share a lock, which costs parallelism, never
    /// correctness.
    pub fn bucket_index(&self, request: &Request) -> usize {
        let mut hasher = DefaultHasher::new();
        request.method().as_str().hash(&mut hasher);
        request.url().hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    pub async fn lock_bucket(&self, index: usize) -> BucketGuard<'_> {
        self.buckets[index].lock().await
    }

    /// Looks up a fresh entry under an already-held bucket guard. Stale
    /// entries are evicted on the way out.
    pub fn lookup(&self, bucket: &mut BucketGuard<'_>, request: &Request) -> Option<Response> {
        let key = cache_key(request);
        let fresh = match bucket.get(&key) {
            Some(entry) => entry.created_at.elapsed() < self.effective_ttl(entry.ttl),
            None => return None,
        };
        if !fresh {
            bucket.remove(&key);
            return None;
        }
        bucket.get(&key).map(|entry| entry.response.clone())
    }

    pub fn should_cache(&self, request: &Request, response: &Response) -> bool {
        if request.method() != Method::GET || response.status() != 200 {
            return false;
        }
        let directives = response
            .header_value("cache-control")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if directives.contains("no-store")
            || directives.contains("no-cache")
            || directives.contains("private")
        {
            return false;
        }
        self.effective_ttl(header_ttl(response)) > Duration::ZERO
    }

    pub fn store(&self, bucket: &mut BucketGuard<'_>, request: &Request, response: &Response) {
        bucket.insert(
            cache_key(request),
            CacheEntry {
                response: response.clone(),
                created_at: Instant::now(),
                ttl: header_ttl(response),
            },
        );
    }

    pub async fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().await.clear();
        }
    }

    /// When set, replaces the header-derived lifetime for both freshness
    /// checks and cacheability decisions.
    pub fn set_max_age(&self, max_age: Duration) {
        *self.max_age.write().expect("max_age lock") = Some(max_age);
    }

    fn effective_ttl(&self, entry_ttl: Duration) -> Duration {
        self.max_age
            .read()
            .expect("max_age lock")
            .unwrap_or(entry_ttl)
    }
}

fn cache_key(request: &Request) -> String {
    format!("{} {}", request.method(), request.url())
}

fn header_ttl(response: &Response) -> Duration {
    let Some(value) = response.header_value("cache-control") else {
        return Duration::ZERO;
    };
    for directive in value.split(',') {
        if let Some(secs) = directive.trim().strip_prefix("max-age=") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                return Duration::from_secs(secs);
            }
        }
    }
    Duration::ZERO
}
