//! The Consumer worker loop (spec §4.E): pop a task, reconstruct its body
//! via a `DataProvider`, stream it through clamd, publish the verdict, and
//! tear down whatever the provider was holding open. A fixed pool of
//! `Worker`s share one `ClamdClient`-per-worker (clamd's `INSTREAM` is not
//! re-entrant on a single connection) and one `TaskQueue`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use virusscan_clamd::{ChunkSource, ClamdClient, ClamdError, ScanOutcome};
use virusscan_dataprovider::{Reader, ReaderError, SharedRedis};
use virusscan_proto::keys::KeySpace;
use virusscan_proto::wire::{Mode, ParsedHeader, Priority, ScanMetrics, ScanResult};
use virusscan_queue::{recover_task_id, PoppedTask, QueueError, TaskQueue};
use virusscan_redis::{RedisError, RedisLike};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("data provider error: {0}")]
    Provider(#[from] ReaderError),
}

pub struct WorkerConfig {
    pub queue_poll_timeout: Duration,
    pub chunk_move_timeout: Duration,
    pub drain_timeout: Duration,
}

/// Adapts a `Reader`'s `next_chunk` to the shape `ClamdClient::scan_stream`
/// expects, without giving `virusscan-clamd` a dependency on the provider
/// crate.
struct ReaderSource<'a>(&'a mut Reader);

#[async_trait::async_trait]
impl ChunkSource for ReaderSource<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ClamdError> {
        self.0
            .next_chunk()
            .await
            .map_err(|err: ReaderError| ClamdError::Io(std::io::Error::other(err.to_string())))
    }
}

pub struct Worker {
    pub id: usize,
    redis: SharedRedis,
    keys: KeySpace,
    queue: Arc<TaskQueue>,
    clamd: Arc<ClamdClient>,
    metrics: Arc<virusscan_observability::Metrics>,
    config: Arc<WorkerConfig>,
}

impl Worker {
    pub fn new(
        id: usize,
        redis: SharedRedis,
        keys: KeySpace,
        queue: Arc<TaskQueue>,
        clamd: Arc<ClamdClient>,
        metrics: Arc<virusscan_observability::Metrics>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Worker {
            id,
            redis,
            keys,
            queue,
            clamd,
            metrics,
            config,
        }
    }

    /// Runs until `cancel` fires. A task already popped off the queue is
    /// always seen through to a published verdict, bounded by
    /// `drain_timeout` once shutdown has been requested (spec §5: "finish
    /// the in-flight task if possible within a 30 s drain, otherwise
    /// publish ERROR and exit").
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let popped = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                popped = self.queue.pop_next(self.config.queue_poll_timeout) => popped,
            };

            let popped = match popped {
                Ok(Some(popped)) => popped,
                Ok(None) => continue,
                Err(QueueError::Malformed { raw, source }) => {
                    tracing::warn!(worker = self.id, error = %source, "dropping malformed queue element");
                    if let Some(task_id) = recover_task_id(&raw) {
                        let result = ScanResult::error(ScanMetrics::default());
                        if let Err(err) = self.queue.publish_result(task_id, &result).await {
                            tracing::warn!(worker = self.id, %task_id, error = %err, "failed to publish ERROR for malformed task");
                        }
                    }
                    continue;
                }
                Err(err) => {
                    tracing::warn!(worker = self.id, error = %err, "queue pop failed");
                    continue;
                }
            };

            if cancel.is_cancelled() {
                match tokio::time::timeout(self.config.drain_timeout, self.process_task(&popped)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(worker = self.id, error = %err, "task processing failed during drain"),
                    Err(_) => {
                        tracing::warn!(worker = self.id, task_id = %popped.header.task_id, "drain timeout exceeded, publishing ERROR");
                        let result = ScanResult::error(ScanMetrics::default());
                        let _ = self.queue.publish_result(popped.header.task_id, &result).await;
                    }
                }
                break;
            }

            if let Err(err) = self.process_task(&popped).await {
                tracing::warn!(worker = self.id, task_id = %popped.header.task_id, error = %err, "task processing failed");
            }
        }
    }

    async fn build_reader(&self, header: &ParsedHeader) -> Result<Reader, ConsumerError> {
        match header.mode {
            Mode::Inline => {
                let body = self.redis.get(&header.content_ref).await?.unwrap_or_default();
                Ok(Reader::inline(body))
            }
            Mode::Stream => Ok(Reader::stream(
                self.redis.clone(),
                &self.keys,
                header.task_id,
                self.config.chunk_move_timeout,
            )),
            Mode::SharedDisk => {
                let path = std::path::PathBuf::from(&header.content_ref);
                Ok(Reader::shared_disk(path).await?)
            }
        }
    }

    /// Steps 3-9 of the Consumer loop: materialize a provider, scan it,
    /// interpret the verdict, publish the result, record metrics.
    ///
    /// STREAM bodies are consumed destructively by `BLMOVE` as they are
    /// read (see `Reader::next_chunk`), so a mid-scan transient failure
    /// cannot be retried from scratch without re-reading chunks already
    /// handed to clamd — only INLINE and SHARED_DISK, whose readers are
    /// cheaply rebuildable, get the exponential-backoff retry spec §7.1
    /// describes; a STREAM failure surfaces as `ERROR` on the first miss.
    async fn process_task(&self, popped: &PoppedTask) -> Result<(), ConsumerError> {
        let header = &popped.header;
        let task_id = header.task_id;
        let scan_start = Instant::now();

        let max_attempts = if header.mode == Mode::Stream { 1 } else { 3 };
        let mut outcome_and_reader = None;
        let mut last_err = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt as u32 - 1));
                tokio::time::sleep(backoff).await;
            }
            let mut reader = match self.build_reader(header).await {
                Ok(reader) => reader,
                Err(err) => {
                    last_err = Some(err.to_string());
                    continue;
                }
            };
            match self.clamd.scan_stream(ReaderSource(&mut reader)).await {
                Ok(outcome) => {
                    outcome_and_reader = Some((outcome, reader));
                    break;
                }
                Err(err) => {
                    tracing::warn!(worker = self.id, %task_id, attempt, error = %err, "clamd scan attempt failed");
                    last_err = Some(err.to_string());
                }
            }
        }

        let scan_ms = scan_start.elapsed().as_millis() as i64;
        let total_tat_ms = total_tat_ms(header.push_time_ns);
        let metrics = ScanMetrics { scan_ms, total_tat_ms };

        let result = match outcome_and_reader {
            Some((ScanOutcome::Clean, reader)) => {
                if let Err(err) = reader.finalize_consume().await {
                    tracing::warn!(worker = self.id, %task_id, error = %err, "failed to finalize clean provider");
                }
                let data_key = matches!(header.mode, Mode::Stream).then(|| self.keys.chunks_verified(task_id));
                ScanResult::clean(metrics, data_key)
            }
            Some((ScanOutcome::Infected { virus }, reader)) => {
                if let Err(err) = reader.cleanup_infected().await {
                    tracing::warn!(worker = self.id, %task_id, error = %err, "failed to clean up infected provider");
                }
                ScanResult::infected(virus, metrics)
            }
            Some((ScanOutcome::Error { message }, reader)) => {
                tracing::warn!(worker = self.id, %task_id, %message, "clamd reported a scan ERROR");
                if let Err(err) = reader.finalize_consume().await {
                    tracing::warn!(worker = self.id, %task_id, error = %err, "failed to finalize errored provider");
                }
                ScanResult::error(metrics)
            }
            None => {
                tracing::warn!(worker = self.id, %task_id, error = last_err.as_deref().unwrap_or("unknown"), "scan failed after retries");
                ScanResult::error(metrics)
            }
        };

        self.record_metrics(popped.priority, &result);
        self.queue.publish_result(task_id, &result).await?;
        Ok(())
    }

    async fn publish_error_for(&self, task_id: Uuid) -> Result<(), ConsumerError> {
        let result = ScanResult::error(ScanMetrics::default());
        self.queue.publish_result(task_id, &result).await?;
        Ok(())
    }

    fn record_metrics(&self, priority: Priority, result: &ScanResult) {
        let verdict = match result.status {
            virusscan_proto::wire::ScanStatus::Clean => "clean",
            virusscan_proto::wire::ScanStatus::Infected => "infected",
            virusscan_proto::wire::ScanStatus::Error => "error",
        };
        let priority_label = match priority {
            Priority::High => "high",
            Priority::Normal => "normal",
        };
        self.metrics.tasks_total.with_label_values(&[verdict, priority_label]).inc();
        let histogram = match priority {
            Priority::High => &self.metrics.priority_tat_ms,
            Priority::Normal => &self.metrics.normal_tat_ms,
        };
        histogram.observe(result.metrics.total_tat_ms as f64);
    }
}

fn total_tat_ms(push_time_ns: u128) -> i64 {
    let now_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    (now_ns.saturating_sub(push_time_ns) / 1_000_000) as i64
}

/// Checks clamd reachability for `/health`; a worker pool shares one
/// lightweight `PING` probe rather than every worker's own connection.
pub struct ClamdHealth {
    clamd: Arc<ClamdClient>,
}

impl ClamdHealth {
    pub fn new(clamd: Arc<ClamdClient>) -> Self {
        ClamdHealth { clamd }
    }
}

#[async_trait::async_trait]
impl virusscan_observability::HealthCheck for ClamdHealth {
    async fn healthy(&self) -> bool {
        self.clamd.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use virusscan_proto::wire::{Priority as WirePriority, Task};
    use virusscan_redis::fake::FakeRedis;

    /// A loopback clamd stand-in that always replies with a fixed verdict,
    /// reused across the tests below (mirrors `virusscan-clamd`'s own test
    /// helper, since INSTREAM framing is identical regardless of caller).
    async fn fake_clamd(reply: &'static [u8]) -> (Arc<ClamdClient>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                sock.write_all(reply).await.ok();
                                break;
                            }
                        }
                    }
                });
            }
        });
        let client = ClamdClient::from_url(&format!("tcp://{addr}")).unwrap();
        (Arc::new(client), addr)
    }

    fn worker(redis: SharedRedis, clamd: Arc<ClamdClient>) -> Worker {
        let keys = KeySpace::new("vs");
        let queue = Arc::new(TaskQueue::new(redis.clone(), keys.clone()));
        let metrics = Arc::new(virusscan_observability::Metrics::new());
        let config = Arc::new(WorkerConfig {
            queue_poll_timeout: Duration::from_millis(50),
            chunk_move_timeout: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
        });
        Worker::new(0, redis, keys, queue, clamd, metrics, config)
    }

    #[tokio::test]
    async fn clean_inline_task_publishes_clean_verdict() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let (clamd, _addr) = fake_clamd(b"stream: OK\n").await;
        let w = worker(redis.clone(), clamd);

        let task = Task::new(WirePriority::Normal, Mode::Inline, 1, "vs:inline:ignored");
        let inline_key = format!("vs:inline:{}", task.task_id);
        redis.set(&inline_key, b"hello world".to_vec(), Some(60)).await.unwrap();

        let mut task = task;
        task.content_ref = inline_key;
        w.queue.enqueue(&task).await.unwrap();

        let popped = w.queue.pop_next(Duration::from_millis(200)).await.unwrap().unwrap();
        w.process_task(&popped).await.unwrap();

        let result = w
            .queue
            .await_result(task.task_id, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, virusscan_proto::wire::ScanStatus::Clean);
    }

    #[tokio::test]
    async fn infected_stream_task_deletes_verified_list() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let (clamd, _addr) = fake_clamd(b"stream: Eicar-Test-Signature FOUND\n").await;
        let w = worker(redis.clone(), clamd);

        let task_id = Uuid::new_v4();
        redis.rpush(&w.keys.chunks(task_id), b"x".to_vec()).await.unwrap();
        redis.set(&w.keys.chunks_done(task_id), b"1".to_vec(), None).await.unwrap();

        let mut task = Task::new(WirePriority::High, Mode::Stream, 1, w.keys.chunks(task_id));
        task.task_id = task_id;
        w.queue.enqueue(&task).await.unwrap();

        let popped = w.queue.pop_next(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(popped.priority, WirePriority::High);
        w.process_task(&popped).await.unwrap();

        let result = w
            .queue
            .await_result(task_id, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, virusscan_proto::wire::ScanStatus::Infected);
        assert_eq!(redis.llen(&w.keys.chunks_verified(task_id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_header_publishes_error_for_recovered_task_id() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let (clamd, _addr) = fake_clamd(b"stream: OK\n").await;
        let w = Arc::new(worker(redis.clone(), clamd));

        let task_id = Uuid::new_v4();
        redis
            .rpush("vs:scan_normal", format!("{task_id}|NOPE|1|x").into_bytes())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let worker_handle = w.clone();
        let run_task = tokio::spawn(async move { worker_handle.run(run_cancel).await });

        let result = w
            .queue
            .await_result(task_id, Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, virusscan_proto::wire::ScanStatus::Error);

        cancel.cancel();
        run_task.await.unwrap();
    }

    #[tokio::test]
    async fn publish_error_for_unreachable_task_writes_error_result() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let (clamd, _addr) = fake_clamd(b"stream: OK\n").await;
        let w = worker(redis.clone(), clamd);
        let task_id = Uuid::new_v4();
        w.publish_error_for(task_id).await.unwrap();
        let result = w
            .queue
            .await_result(task_id, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, virusscan_proto::wire::ScanStatus::Error);
    }
}
