//! CLI + environment configuration shared by the Producer and Consumer
//! binaries, in the style of `dekaf::Cli`: one `clap` derive struct per
//! binary, env vars as the fallback source, flags always win.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::Serialize;

/// Process exit codes. Matches spec §6: 0 normal, 1 config error,
/// 2 dependency unreachable on startup, 130 SIGINT.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const DEPENDENCY_UNREACHABLE: i32 = 2;
    pub const SIGINT: i32 = 130;
}

fn parse_duration_ms(s: &str) -> Result<Duration, humantime::DurationError> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .or_else(|_| humantime::parse_duration(s))
}

/// Config shared verbatim by both binaries: where Redis and clamd live, and
/// the observability surface.
#[derive(Args, Debug, Clone, Serialize)]
pub struct SharedArgs {
    /// Redis host to connect to.
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis port to connect to.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Key prefix under which all Redis keys for this deployment live.
    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = "virusscan")]
    pub redis_key_prefix: String,

    /// clamd endpoint, `tcp://host:port` or `unix:///path`.
    #[arg(long, env = "CLAMD_URL", default_value = "tcp://127.0.0.1:3310")]
    pub clamd_url: String,

    /// Directory backing the SHARED_DISK DataProvider. Must be a shared RWX
    /// mount between every Producer and Consumer replica.
    #[arg(long, env = "SCAN_TMP_DIR", default_value = "/tmp/virusscan")]
    pub scan_tmp_dir: PathBuf,

    /// Body size, in MiB, above which the SHARED_DISK provider is used
    /// instead of buffering in memory or streaming through Redis lists.
    #[arg(long, env = "SCAN_FILE_THRESHOLD_MB", default_value_t = 10)]
    pub scan_file_threshold_mb: u64,

    /// Port the observability surface (`/metrics`, `/health`) listens on.
    #[arg(long, env = "OBSERVABILITY_PORT", default_value_t = 8080)]
    pub observability_port: u16,

    /// Node identity used for HA heartbeats and lock ownership. Defaults to
    /// the process hostname.
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,
}

impl SharedArgs {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname_fallback()
        })
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("node-{}", std::process::id()))
}

/// Producer-only configuration.
#[derive(Args, Debug, Clone, Serialize)]
pub struct ProducerArgs {
    /// Port the ext_proc gRPC server listens on.
    #[arg(long, env = "PRODUCER_PORT", default_value_t = 50051)]
    pub producer_port: u16,

    /// Port the ICAP server listens on, if enabled.
    #[arg(long, env = "ICAP_PORT")]
    pub icap_port: Option<u16>,

    /// Deadline, from ENQUEUE, for a verdict to arrive before
    /// `failure_mode_allow` is applied.
    #[arg(
        long,
        env = "PROCESSING_TIMEOUT_MS",
        default_value = "30000",
        value_parser = parse_duration_ms,
    )]
    pub processing_timeout: Duration,

    /// Whether a timed-out scan admits (`true`) or blocks with 503
    /// (`false`).
    #[arg(long, env = "FAILURE_MODE_ALLOW", default_value_t = true)]
    pub failure_mode_allow: bool,

    /// HTTP status used for the immediate-response block page.
    #[arg(long, env = "BLOCK_STATUS_CODE", default_value_t = 406)]
    pub block_status_code: u16,

    /// Body buffered in memory, per stream, before SPILL to STREAM or
    /// SHARED_DISK.
    #[arg(long, env = "BUFFER_THRESHOLD_BYTES", default_value_t = 64 * 1024)]
    pub buffer_threshold_bytes: usize,

    /// Absolute cap on ingest body size; requests beyond this are rejected
    /// with 413 and never enqueued.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 2 * 1024 * 1024 * 1024)]
    pub max_body_bytes: u64,
}

/// Consumer-only configuration.
#[derive(Args, Debug, Clone, Serialize)]
pub struct ConsumerArgs {
    /// Number of scan workers in this process. Defaults to the number of
    /// available CPU cores.
    #[arg(long, env = "WORKER_COUNT")]
    pub worker_count: Option<usize>,

    /// Timeout for a single `BRPOP scan_priority scan_normal <timeout>`
    /// poll, in seconds.
    #[arg(long, env = "QUEUE_POLL_TIMEOUT_SECS", default_value_t = 5)]
    pub queue_poll_timeout_secs: u64,

    /// Timeout for a single `BLMOVE` during STREAM follower scanning.
    #[arg(long, env = "CHUNK_MOVE_TIMEOUT_SECS", default_value_t = 5)]
    pub chunk_move_timeout_secs: u64,

    /// Time budget to finish an in-flight task during SIGTERM drain.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// How often the HA coordinator re-checks `target_epoch`.
    #[arg(long, env = "HA_CHECK_INTERVAL_SECS", default_value_t = 5)]
    pub ha_check_interval_secs: u64,

    /// Bound on a single engine reload, including the watchdog-extended
    /// lock hold.
    #[arg(long, env = "RELOAD_TIMEOUT_SECS", default_value_t = 120)]
    pub reload_timeout_secs: u64,
}

impl ConsumerArgs {
    pub fn worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

/// `IntelligentCache` configuration, shared by both binaries (the Producer
/// consults it for bypass/priority decisions, the Consumer for verdict
/// memoization).
#[derive(Args, Debug, Clone, Serialize)]
pub struct CacheArgs {
    /// Additional trusted registry hosts, beyond the built-in defaults,
    /// that are deprioritized to `normal` rather than bypassed.
    #[arg(long, env = "TRUSTED_HOSTS", value_delimiter = ',')]
    pub trusted_hosts: Vec<String>,

    /// Hosts whose requests skip scanning entirely.
    #[arg(long, env = "BYPASS_HOSTS", value_delimiter = ',')]
    pub bypass_hosts: Vec<String>,

    /// How long a clean verdict stays cached.
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub ttl_seconds: i64,
}

/// Redact anything that looks like a credential before a `config print`
/// dump. No field in `SharedArgs`/`ProducerArgs`/`ConsumerArgs`/`CacheArgs`
/// currently carries one, but the CLI surface is user-extended over time and
/// this keeps `config print` safe by default rather than by audit.
pub fn redact_secrets(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let lower = k.to_ascii_lowercase();
                    if ["password", "secret", "token", "apikey", "api_key"]
                        .iter()
                        .any(|needle| lower.contains(needle))
                    {
                        (k, serde_json::Value::String("***redacted***".to_string()))
                    } else {
                        (k, redact_secrets(v))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_falls_back_to_pid_when_unset() {
        let args = SharedArgs {
            redis_host: "localhost".into(),
            redis_port: 6379,
            redis_key_prefix: "virusscan".into(),
            clamd_url: "tcp://127.0.0.1:3310".into(),
            scan_tmp_dir: "/tmp/virusscan".into(),
            scan_file_threshold_mb: 10,
            observability_port: 8080,
            node_id: None,
        };
        assert!(!args.node_id().is_empty());
    }

    #[test]
    fn redis_url_shape() {
        let args = SharedArgs {
            redis_host: "redis.internal".into(),
            redis_port: 6380,
            redis_key_prefix: "virusscan".into(),
            clamd_url: "tcp://127.0.0.1:3310".into(),
            scan_tmp_dir: "/tmp/virusscan".into(),
            scan_file_threshold_mb: 10,
            observability_port: 8080,
            node_id: Some("node-a".into()),
        };
        assert_eq!(args.redis_url(), "redis://redis.internal:6380/");
        assert_eq!(args.node_id(), "node-a");
    }

    #[test]
    fn redact_secrets_masks_credential_like_keys_at_any_depth() {
        let value = serde_json::json!({
            "redis_host": "localhost",
            "nested": {
                "api_token": "s3cr3t",
                "port": 6379,
            },
        });
        let redacted = redact_secrets(value);
        assert_eq!(redacted["redis_host"], "localhost");
        assert_eq!(redacted["nested"]["api_token"], "***redacted***");
        assert_eq!(redacted["nested"]["port"], 6379);
    }
}
