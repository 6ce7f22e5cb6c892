//! `IntelligentCache`: bypass/priority host classification plus read-through
//! memoization of clean verdicts, keyed by `(normalized_uri,
//! sha256(body_prefix_4KiB))`. Grounded on the same read-through-cache shape
//! as the rest of this system's Redis usage: a narrow key surface, TTL-bound
//! values, no client-side invalidation.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;
use virusscan_proto::keys::KeySpace;
use virusscan_proto::wire::{Priority, ScanResult, ScanStatus};
use virusscan_redis::RedisLike;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] virusscan_redis::RedisError),
    #[error("malformed cached verdict: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registry hosts trusted enough to be deprioritized to `normal`, but still
/// scanned — the default list a fresh deployment ships with.
pub const DEFAULT_TRUSTED_HOSTS: &[&str] = &[
    "get.docker.com",
    "registry-1.docker.io",
    "quay.io",
    "gcr.io",
    "ghcr.io",
    "registry.k8s.io",
    "pypi.org",
    "registry.npmjs.org",
    "github.com",
    "*.maven.org",
];

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub trusted_hosts: Vec<String>,
    pub bypass_hosts: Vec<String>,
    pub ttl_seconds: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            trusted_hosts: DEFAULT_TRUSTED_HOSTS.iter().map(|s| s.to_string()).collect(),
            bypass_hosts: Vec::new(),
            ttl_seconds: virusscan_proto::keys::CACHE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    /// Build from admin-supplied additions; these are appended to, not
    /// substituted for, the built-in trusted-host defaults.
    pub fn with_additions(
        trusted_hosts: Vec<String>,
        bypass_hosts: Vec<String>,
        ttl_seconds: i64,
    ) -> Self {
        let mut cfg = CacheConfig {
            bypass_hosts,
            ttl_seconds,
            ..CacheConfig::default()
        };
        cfg.trusted_hosts.extend(trusted_hosts);
        cfg
    }
}

/// Where a request's destination host places it for bypass/priority
/// purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    Bypass,
    Trusted,
    Ordinary,
}

pub struct IntelligentCache {
    redis: Arc<dyn RedisLike>,
    keys: KeySpace,
    config: CacheConfig,
}

impl IntelligentCache {
    pub fn new(redis: Arc<dyn RedisLike>, keys: KeySpace, config: CacheConfig) -> Self {
        IntelligentCache { redis, keys, config }
    }

    /// Classify a request's origin host for bypass/priority decisions.
    /// Matching is suffix-based for `*.`-prefixed patterns, exact otherwise.
    pub fn classify_host(&self, host: &str) -> HostClass {
        if host_matches_any(host, &self.config.bypass_hosts) {
            HostClass::Bypass
        } else if host_matches_any(host, &self.config.trusted_hosts) {
            HostClass::Trusted
        } else {
            HostClass::Ordinary
        }
    }

    /// Priority a request should be enqueued at, given its host class and
    /// any explicit client-asserted priority header.
    pub fn priority_for(&self, host: &str, asserted: Priority) -> Priority {
        match self.classify_host(host) {
            HostClass::Trusted => Priority::Normal,
            _ => asserted,
        }
    }

    /// `(normalized_uri, sha256(body_prefix_4KiB))` fingerprint.
    pub fn fingerprint(origin_uri: &str, body_prefix: &[u8]) -> String {
        let normalized = normalize_uri(origin_uri);
        let prefix_len = body_prefix.len().min(4096);
        let mut hasher = Sha256::new();
        hasher.update(&body_prefix[..prefix_len]);
        let digest = hasher.finalize();
        format!("{normalized}:{digest:x}")
    }

    /// Look up a memoized clean verdict. Returns `None` on cache miss;
    /// infected verdicts are never cached, so a miss says nothing about
    /// whether the content is clean.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<ScanResult>, CacheError> {
        let key = self.keys.cache_verdict(fingerprint);
        match self.redis.get(&key).await? {
            Some(raw) => {
                let result: ScanResult = serde_json::from_slice(&raw)?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Memoize a verdict. A no-op for anything but `Clean` — infected
    /// verdicts always force a re-scan so operational alerting fires every
    /// time, not just on first detection.
    pub async fn record(&self, fingerprint: &str, result: &ScanResult) -> Result<(), CacheError> {
        if result.status != ScanStatus::Clean {
            return Ok(());
        }
        let key = self.keys.cache_verdict(fingerprint);
        let body = serde_json::to_vec(result)?;
        self.redis.set(&key, body, Some(self.config.ttl_seconds)).await?;
        Ok(())
    }
}

fn host_matches_any(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| host_matches(host, pattern))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
        None => host.eq_ignore_ascii_case(pattern),
    }
}

/// Normalize a URI for fingerprinting: lowercase scheme/host, strip a
/// trailing `/`, drop the query string (query parameters vary run-to-run for
/// signed URLs and would otherwise defeat memoization).
fn normalize_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            let mut s = url.to_string();
            if s.ends_with('/') && s.matches('/').count() > 2 {
                s.pop();
            }
            s
        }
        Err(_) => uri.trim_end_matches('/').to_string(),
    }
}
