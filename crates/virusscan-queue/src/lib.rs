//! The Redis-backed task queue shared by Producer and Consumer: push a task
//! header onto the right priority list, pop the next one off with strict
//! priority ordering, and carry the eventual verdict back.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use virusscan_proto::keys::{KeySpace, RESULT_TTL_SECS};
use virusscan_proto::wire::{ParsedHeader, Priority, ScanResult, Task};
use virusscan_redis::RedisLike;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] virusscan_redis::RedisError),
    #[error("malformed scan result: {0}")]
    Json(#[from] serde_json::Error),
    /// A queue element was popped (so it can never be redelivered) but its
    /// header failed to parse. `raw` is kept so the caller can attempt a
    /// best-effort recovery of the task_id to publish an `ERROR` verdict
    /// (spec §7.2: a protocol violation still surfaces as `ERROR`).
    #[error("malformed queue element {raw:?}: {source}")]
    Malformed {
        raw: String,
        source: virusscan_proto::wire::WireError,
    },
}

/// A task header popped off whichever priority list had it, plus which list
/// that was — the list membership itself is the task's effective priority,
/// and is not recoverable from the header alone once popped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoppedTask {
    pub header: ParsedHeader,
    pub priority: Priority,
}

/// Best-effort recovery of a task_id from a queue element that otherwise
/// failed to parse, so an `ERROR` verdict still has somewhere to go. Only
/// the first field needs to be intact; a corrupt `task_id` itself makes the
/// task truly unrecoverable and it is dropped (logged by the caller).
pub fn recover_task_id(raw: &str) -> Option<Uuid> {
    raw.split('|').next().and_then(|s| Uuid::parse_str(s).ok())
}

pub struct TaskQueue {
    redis: Arc<dyn RedisLike>,
    keys: KeySpace,
}

impl TaskQueue {
    pub fn new(redis: Arc<dyn RedisLike>, keys: KeySpace) -> Self {
        TaskQueue { redis, keys }
    }

    /// Producer side: push a task's header onto its priority's list.
    pub async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let list = match task.priority {
            Priority::High => self.keys.scan_priority(),
            Priority::Normal => self.keys.scan_normal(),
        };
        self.redis
            .lpush(&list, task.encode_header().into_bytes())
            .await?;
        Ok(())
    }

    /// Producer side: block waiting for the Consumer-published verdict.
    pub async fn await_result(
        &self,
        task_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<ScanResult>, QueueError> {
        let key = self.keys.result(task_id);
        let popped = self.redis.brpop(&[&key], timeout).await?;
        match popped {
            Some(popped) => {
                let raw = String::from_utf8_lossy(&popped.value);
                Ok(Some(ScanResult::from_json(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Consumer side: pop the next task header, honoring strict priority
    /// (a non-empty `scan_priority` list always wins over `scan_normal`).
    /// The list a task actually came from is reported back, since that is
    /// no longer recoverable from the header alone once it is popped.
    pub async fn pop_next(&self, timeout: Duration) -> Result<Option<PoppedTask>, QueueError> {
        let priority_key = self.keys.scan_priority();
        let normal_key = self.keys.scan_normal();
        let popped = self
            .redis
            .brpop(&[&priority_key, &normal_key], timeout)
            .await?;
        match popped {
            Some(popped) => {
                let priority = if popped.key == priority_key {
                    Priority::High
                } else {
                    Priority::Normal
                };
                let raw = String::from_utf8_lossy(&popped.value).into_owned();
                match Task::parse_header(&raw) {
                    Ok(header) => Ok(Some(PoppedTask { header, priority })),
                    Err(err) => Err(QueueError::Malformed {
                        raw,
                        source: err,
                    }),
                }
            }
            None => Ok(None),
        }
    }

    /// Consumer side: publish a verdict so the Producer's `await_result`
    /// wakes up, bounded by a short TTL in case nobody is listening.
    pub async fn publish_result(&self, task_id: Uuid, result: &ScanResult) -> Result<(), QueueError> {
        let key = self.keys.result(task_id);
        self.redis
            .lpush(&key, result.to_json().into_bytes())
            .await?;
        self.redis.expire(&key, RESULT_TTL_SECS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virusscan_proto::wire::{Mode, ScanMetrics};
    use virusscan_redis::fake::FakeRedis;

    fn queue() -> (TaskQueue, Arc<FakeRedis>) {
        let redis = Arc::new(FakeRedis::new());
        let queue = TaskQueue::new(redis.clone(), KeySpace::new("vs"));
        (queue, redis)
    }

    #[tokio::test]
    async fn priority_tasks_pop_before_normal_tasks() {
        let (queue, _redis) = queue();
        let normal = Task::new(Priority::Normal, Mode::Inline, 1, "inline:a");
        let high = Task::new(Priority::High, Mode::Inline, 2, "inline:b");
        queue.enqueue(&normal).await.unwrap();
        queue.enqueue(&high).await.unwrap();

        let popped = queue.pop_next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(popped.header.task_id, high.task_id);
        assert_eq!(popped.priority, Priority::High);
        let popped = queue.pop_next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(popped.header.task_id, normal.task_id);
        assert_eq!(popped.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn pop_next_times_out_when_empty() {
        let (queue, _redis) = queue();
        let popped = queue.pop_next(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_next_surfaces_malformed_header_with_recoverable_task_id() {
        let (queue, redis) = queue();
        let task_id = Uuid::new_v4();
        redis
            .rpush("vs:scan_normal", format!("{task_id}|WEIRD|1|x").into_bytes())
            .await
            .unwrap();

        let err = queue.pop_next(Duration::from_millis(50)).await.unwrap_err();
        match err {
            QueueError::Malformed { raw, .. } => {
                assert_eq!(recover_task_id(&raw), Some(task_id));
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_then_await_round_trips_the_verdict() {
        let (queue, _redis) = queue();
        let task_id = Uuid::new_v4();
        let result = ScanResult::clean(
            ScanMetrics {
                scan_ms: 5,
                total_tat_ms: 9,
            },
            None,
        );
        queue.publish_result(task_id, &result).await.unwrap();

        let got = queue
            .await_result(task_id, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.status, result.status);
    }

    #[tokio::test]
    async fn await_result_times_out_when_nothing_published() {
        let (queue, _redis) = queue();
        let got = queue
            .await_result(Uuid::new_v4(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
