//! The per-stream state machine (spec §4.D), shared by the gRPC ext_proc
//! adapter and the ICAP adapter. Protocol-agnostic: it is driven by plain
//! header/body events and returns a `Decision` the adapter translates into
//! its own wire format.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use virusscan_cache::IntelligentCache;
use virusscan_dataprovider::{select_mode, SelectionInput, SharedRedis, Writer, ABSOLUTE_MAX_BODY_BYTES};
use virusscan_proto::keys::KeySpace;
use virusscan_proto::{Mode, Priority, RequestMetadata, ScanStatus, Task};
use virusscan_queue::TaskQueue;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("data provider error: {0}")]
    Provider(#[from] virusscan_dataprovider::WriterError),
    #[error("queue error: {0}")]
    Queue(#[from] virusscan_queue::QueueError),
    #[error("cache error: {0}")]
    Cache(#[from] virusscan_cache::CacheError),
}

pub struct SessionConfig {
    pub inline_threshold_bytes: u64,
    pub shared_disk_dir: Option<std::path::PathBuf>,
    pub processing_timeout: Duration,
    pub failure_mode_allow: bool,
    pub block_status_code: u16,
}

/// Outcome handed back to the protocol adapter for this stream.
pub enum Decision {
    /// Keep streaming; no response yet.
    Continue,
    /// Short-circuit to RELAY: no scan occurred (disabled route or bypass
    /// host). `headers` is empty for a silent admit.
    Admit { headers: Vec<(String, String)> },
    Block {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

enum Body {
    /// Accumulating in memory; still below `inline_threshold_bytes`.
    Buffering(Vec<u8>),
    /// Spilled to STREAM or SHARED_DISK once the in-memory threshold was
    /// crossed.
    Spilled { writer: Writer, mode: Mode, len: u64 },
}

/// Per-stream session state. One instance per proxied HTTP transaction.
pub struct Session {
    redis: SharedRedis,
    keys: KeySpace,
    cache: Arc<IntelligentCache>,
    queue: Arc<TaskQueue>,
    metrics: Arc<virusscan_observability::Metrics>,
    config: Arc<SessionConfig>,

    body: Body,
    cache_checked: bool,
    bypassed: bool,
    fingerprint: Option<String>,
    metadata: RequestMetadata,
    priority: Priority,
    push_time_ns: u128,
    headers_arrived_ns: u128,
}

impl Session {
    pub fn new(
        redis: SharedRedis,
        keys: KeySpace,
        cache: Arc<IntelligentCache>,
        queue: Arc<TaskQueue>,
        metrics: Arc<virusscan_observability::Metrics>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Session {
            redis,
            keys,
            cache,
            queue,
            metrics,
            config,
            body: Body::Buffering(Vec::new()),
            cache_checked: false,
            bypassed: false,
            fingerprint: None,
            metadata: RequestMetadata::default(),
            priority: Priority::Normal,
            push_time_ns: 0,
            headers_arrived_ns: 0,
        }
    }

    /// `START ──headers──▶ DECIDE_BYPASS`. Route-disabled short-circuits to
    /// RELAY/ADMIT before any body is read.
    pub fn on_request_headers(
        &mut self,
        metadata: RequestMetadata,
        route_disabled: bool,
        asserted_priority: Priority,
    ) -> Decision {
        self.metadata = metadata;
        self.headers_arrived_ns = now_ns();

        if route_disabled {
            self.bypassed = true;
            self.metrics.bypass_total.with_label_values(&["route_disabled"]).inc();
            return Decision::Admit { headers: vec![] };
        }

        let host = self
            .metadata
            .origin_uri
            .parse::<url::Url>()
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        if self.cache.classify_host(&host) == virusscan_cache::HostClass::Bypass {
            self.bypassed = true;
            self.metrics.bypass_total.with_label_values(&["host"]).inc();
            return Decision::Admit { headers: vec![] };
        }

        self.priority = self.cache.priority_for(&host, asserted_priority);
        Decision::Continue
    }

    /// `BUFFERING`/`SPILL`, ending in `ENQUEUE`/`WAIT_VERDICT` at EOF, or a
    /// cache-hit short-circuit to RELAY.
    pub async fn on_request_body(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<Decision, SessionError> {
        if self.bypassed {
            return Ok(Decision::Continue);
        }

        if let Some(decision) = self.push_body_bytes(chunk).await? {
            return Ok(decision);
        }

        if self.total_len() > ABSOLUTE_MAX_BODY_BYTES {
            return Ok(Decision::Block {
                status: 413,
                headers: vec![],
                body: b"request body exceeds the configured absolute size limit".to_vec(),
            });
        }

        if !self.cache_checked && (self.current_prefix_len() >= 4096 || end_of_stream) {
            self.cache_checked = true;
            let fingerprint = IntelligentCache::fingerprint(&self.metadata.origin_uri, self.current_prefix());
            self.fingerprint = Some(fingerprint.clone());
            if let Some(result) = self.cache.lookup(&fingerprint).await? {
                if result.status == ScanStatus::Clean {
                    self.metrics.cache_hits_total.inc();
                    self.bypassed = true;
                    return Ok(Decision::Admit {
                        headers: vec![("X-Scan-Result".into(), "clean".into())],
                    });
                }
            } else {
                self.metrics.cache_misses_total.inc();
            }
        }

        if !end_of_stream {
            return Ok(Decision::Continue);
        }

        self.enqueue_and_await().await
    }

    fn total_len(&self) -> u64 {
        match &self.body {
            Body::Buffering(buf) => buf.len() as u64,
            Body::Spilled { len, .. } => *len,
        }
    }

    fn current_prefix_len(&self) -> usize {
        match &self.body {
            Body::Buffering(buf) => buf.len().min(4096),
            Body::Spilled { .. } => 4096,
        }
    }

    fn current_prefix(&self) -> &[u8] {
        match &self.body {
            Body::Buffering(buf) => &buf[..buf.len().min(4096)],
            // Once spilled we no longer hold the prefix bytes in memory;
            // the cache check has already run by the time spill happens
            // (see push_body_bytes), so this is unreachable in practice.
            Body::Spilled { .. } => &[],
        }
    }

    /// Returns `Some(decision)` when the push triggered a spill that itself
    /// resolved via a cache hit — the caller must short-circuit on that
    /// rather than continue accumulating the body.
    async fn push_body_bytes(&mut self, chunk: &[u8]) -> Result<Option<Decision>, SessionError> {
        let should_spill = match &mut self.body {
            Body::Buffering(buf) => {
                buf.extend_from_slice(chunk);
                (buf.len() as u64) > self.config.inline_threshold_bytes
            }
            Body::Spilled { writer, len, .. } => {
                writer.push(chunk).await?;
                *len += chunk.len() as u64;
                false
            }
        };
        if should_spill {
            return self.spill().await;
        }
        Ok(None)
    }

    /// Moves the buffered prefix to a STREAM/SHARED_DISK writer. The cache
    /// lookup on the buffered prefix happens here, not only in
    /// `on_request_body`'s post-push check — a body that crosses
    /// `inline_threshold_bytes` in a single `push_body_bytes` call (the
    /// common case for a request delivered whole, e.g. over ICAP) spills
    /// before that check ever runs, so skipping the lookup here would mean
    /// large bodies never hit the cache.
    async fn spill(&mut self) -> Result<Option<Decision>, SessionError> {
        let Body::Buffering(buf) = std::mem::replace(&mut self.body, Body::Buffering(Vec::new())) else {
            return Ok(None);
        };

        if !self.cache_checked {
            self.cache_checked = true;
            let fingerprint = IntelligentCache::fingerprint(&self.metadata.origin_uri, &buf[..buf.len().min(4096)]);
            self.fingerprint = Some(fingerprint.clone());
            if let Some(result) = self.cache.lookup(&fingerprint).await? {
                if result.status == ScanStatus::Clean {
                    self.metrics.cache_hits_total.inc();
                    self.bypassed = true;
                    return Ok(Some(Decision::Admit {
                        headers: vec![("X-Scan-Result".into(), "clean".into())],
                    }));
                }
            } else {
                self.metrics.cache_misses_total.inc();
            }
        }

        let mode = select_mode(&SelectionInput {
            body_len: buf.len() as u64,
            inline_threshold_bytes: self.config.inline_threshold_bytes,
            shared_disk_configured: self.config.shared_disk_dir.is_some(),
        });

        let task_id = Uuid::new_v4();
        let mut writer = match mode {
            Mode::Stream => Writer::stream(self.redis.clone(), &self.keys, task_id),
            Mode::SharedDisk => {
                let dir = self
                    .config
                    .shared_disk_dir
                    .as_deref()
                    .expect("select_mode only returns SharedDisk when a dir is configured");
                Writer::shared_disk(dir, task_id).await?
            }
            Mode::Inline => unreachable!("select_mode never returns Inline once the in-memory threshold is exceeded"),
        };

        let len = buf.len() as u64;
        writer.push(&buf).await?;

        self.body = Body::Spilled { writer, mode, len };
        Ok(None)
    }

    async fn enqueue_and_await(&mut self) -> Result<Decision, SessionError> {
        let push_time_ns = now_ns();
        self.push_time_ns = push_time_ns;

        let ingest_ms = push_time_ns.saturating_sub(self.headers_arrived_ns) as f64 / 1_000_000.0;
        self.metrics.ingest_tat_ms.observe(ingest_ms);

        let (task_id, mode, content_ref) = match std::mem::replace(&mut self.body, Body::Buffering(Vec::new())) {
            Body::Buffering(buf) => {
                let task_id = Uuid::new_v4();
                let mut writer = Writer::inline(self.redis.clone(), &self.keys, task_id);
                writer.push(&buf).await?;
                let content_ref = writer.content_ref();
                writer.finalize().await?;
                (task_id, Mode::Inline, content_ref)
            }
            Body::Spilled { writer, mode, .. } => {
                let content_ref = writer.content_ref();
                writer.finalize().await?;
                (uuid_from_content_ref(&content_ref), mode, content_ref)
            }
        };

        let mut task = Task::new(self.priority, mode, push_time_ns, content_ref);
        task.task_id = task_id;
        task.request_metadata = Some(self.metadata.clone());

        self.queue.enqueue(&task).await?;

        match self.queue.await_result(task.task_id, self.config.processing_timeout).await? {
            Some(result) => {
                let verdict_label = match result.status {
                    ScanStatus::Clean => "clean",
                    ScanStatus::Infected => "infected",
                    ScanStatus::Error => "error",
                };
                self.metrics
                    .tasks_total
                    .with_label_values(&[verdict_label, priority_label(self.priority)])
                    .inc();

                match result.status {
                    ScanStatus::Clean => {
                        if let Some(fingerprint) = &self.fingerprint {
                            let _ = self.cache.record(fingerprint, &result).await;
                        }
                        Ok(Decision::Admit {
                            headers: vec![
                                ("X-Scan-Result".into(), "clean".into()),
                                ("X-Scan-TAT-ms".into(), result.metrics.total_tat_ms.to_string()),
                            ],
                        })
                    }
                    ScanStatus::Infected => Ok(Decision::Block {
                        status: self.config.block_status_code,
                        headers: vec![
                            ("X-Virus-Infected".into(), "true".into()),
                            ("X-Virus-Name".into(), result.virus.clone().unwrap_or_default()),
                        ],
                        body: b"request blocked: malicious content detected".to_vec(),
                    }),
                    ScanStatus::Error => Ok(self.apply_failure_mode()),
                }
            }
            None => {
                self.metrics.timeouts_total.inc();
                Ok(self.apply_failure_mode())
            }
        }
    }

    fn apply_failure_mode(&self) -> Decision {
        if self.config.failure_mode_allow {
            Decision::Admit {
                headers: vec![("X-Scan-Result".into(), "timeout-allow".into())],
            }
        } else {
            Decision::Block {
                status: 503,
                headers: vec![],
                body: b"scan verdict unavailable".to_vec(),
            }
        }
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
    }
}

fn now_ns() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// `Writer::content_ref` for STREAM/SHARED_DISK does not itself carry the
/// task_id as a parseable UUID in all cases (SHARED_DISK's is a path whose
/// final component is the task_id; STREAM's is a `chunks:<task_id>` key).
/// Both embed the id as their final `:`/`/`-delimited segment.
fn uuid_from_content_ref(content_ref: &str) -> Uuid {
    let segment = content_ref.rsplit(['/', ':']).next().unwrap_or(content_ref);
    Uuid::parse_str(segment).unwrap_or_else(|_| Uuid::new_v4())
}
