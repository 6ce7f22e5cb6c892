use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;
use virusscan_proto::keys::{KeySpace, RESULT_TTL_SECS};

use crate::{SharedRedis, MAX_CHUNK_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("redis error: {0}")]
    Redis(#[from] virusscan_redis::RedisError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumer-side half of a `DataProvider`: a lazy, finite, non-restartable
/// sequence of byte chunks, reconstructed from wherever the Producer put
/// the body.
pub enum Reader {
    Inline {
        body: Option<Vec<u8>>,
    },
    Stream {
        redis: SharedRedis,
        chunks_key: String,
        done_key: String,
        verified_key: String,
        move_timeout: Duration,
    },
    SharedDisk {
        path: PathBuf,
        file: tokio::fs::File,
    },
}

impl Reader {
    pub fn inline(body: Vec<u8>) -> Self {
        Reader::Inline { body: Some(body) }
    }

    pub fn stream(
        redis: SharedRedis,
        keys: &KeySpace,
        task_id: Uuid,
        move_timeout: Duration,
    ) -> Self {
        Reader::Stream {
            redis,
            chunks_key: keys.chunks(task_id),
            done_key: keys.chunks_done(task_id),
            verified_key: keys.chunks_verified(task_id),
            move_timeout,
        }
    }

    pub async fn shared_disk(path: PathBuf) -> Result<Self, ReaderError> {
        let file = tokio::fs::File::open(&path).await?;
        Ok(Reader::SharedDisk { path, file })
    }

    /// Yield the next chunk, or `None` on EOF. Never restartable: once this
    /// returns `None`, subsequent calls also return `None`.
    ///
    /// For STREAM, each successful `BLMOVE` simultaneously claims the chunk
    /// for scanning and records it in `:verified` — consumption and
    /// verification are the same atomic step, which is why the `:verified`
    /// cleanup on an INFECTED verdict (`cleanup_infected`) is what actually
    /// enforces "never hand infected bytes downstream", not the order in
    /// which we happen to call clamd.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ReaderError> {
        match self {
            Reader::Inline { body } => Ok(body.take()),
            Reader::Stream {
                redis,
                chunks_key,
                done_key,
                verified_key,
                move_timeout,
            } => loop {
                if let Some(chunk) = redis.blmove(chunks_key, verified_key, *move_timeout).await? {
                    return Ok(Some(chunk));
                }
                let done = redis.exists(done_key).await?;
                let remaining = redis.llen(chunks_key).await?;
                if done && remaining == 0 {
                    return Ok(None);
                }
                // Producer hasn't finished yet; a `BLMOVE` timeout here is
                // expected and not an error, so loop and wait again.
            },
            Reader::SharedDisk { file, .. } => {
                use tokio::io::AsyncReadExt;
                let mut buf = vec![0u8; MAX_CHUNK_BYTES];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
            }
        }
    }

    /// Called once, after a CLEAN verdict: release any provider-owned
    /// resources that should not outlive the task.
    pub async fn finalize_consume(self) -> Result<(), ReaderError> {
        match self {
            Reader::Inline { .. } => Ok(()),
            Reader::Stream {
                redis, verified_key, ..
            } => {
                // The relay reads `:verified` after the verdict; bound its
                // lifetime so it does not leak if the relay never shows up.
                redis.expire(&verified_key, RESULT_TTL_SECS).await?;
                Ok(())
            }
            Reader::SharedDisk { path, .. } => {
                tokio::fs::remove_file(&path).await.or_else(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        Ok(())
                    } else {
                        Err(err)
                    }
                })?;
                Ok(())
            }
        }
    }

    /// Called once, after an INFECTED verdict: delete any verified/staged
    /// bytes so they are never handed to a downstream reader (spec §3
    /// invariant: `|chunks:verified| == 0` after INFECTED completion).
    pub async fn cleanup_infected(self) -> Result<(), ReaderError> {
        match self {
            Reader::Inline { .. } => Ok(()),
            Reader::Stream {
                redis, verified_key, ..
            } => {
                redis.del(&verified_key).await?;
                Ok(())
            }
            Reader::SharedDisk { path, .. } => {
                tokio::fs::remove_file(&path).await.or_else(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        Ok(())
                    } else {
                        Err(err)
                    }
                })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use virusscan_redis::fake::FakeRedis;
    use virusscan_redis::RedisLike;

    #[tokio::test]
    async fn inline_reader_yields_exactly_one_chunk_even_when_empty() {
        let mut r = Reader::inline(Vec::new());
        assert_eq!(r.next_chunk().await.unwrap(), Some(Vec::new()));
        assert_eq!(r.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_reader_drains_then_sees_done_sentinel() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let task_id = Uuid::new_v4();
        redis.rpush(&keys.chunks(task_id), b"a".to_vec()).await.unwrap();
        redis.rpush(&keys.chunks(task_id), b"b".to_vec()).await.unwrap();
        redis
            .set(&keys.chunks_done(task_id), b"1".to_vec(), None)
            .await
            .unwrap();

        let mut r = Reader::stream(redis.clone(), &keys, task_id, Duration::from_millis(20));
        assert_eq!(r.next_chunk().await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(r.next_chunk().await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(r.next_chunk().await.unwrap(), None);

        assert_eq!(redis.llen(&keys.chunks_verified(task_id)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cleanup_infected_deletes_verified_list() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let task_id = Uuid::new_v4();
        redis
            .rpush(&keys.chunks_verified(task_id), b"a".to_vec())
            .await
            .unwrap();

        let r = Reader::stream(redis.clone(), &keys, task_id, Duration::from_millis(20));
        r.cleanup_infected().await.unwrap();
        assert_eq!(redis.llen(&keys.chunks_verified(task_id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shared_disk_reader_streams_file_in_chunks_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let mut r = Reader::shared_disk(path.clone()).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = r.next_chunk().await.unwrap() {
            collected.extend(chunk);
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn finalize_consume_removes_shared_disk_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        tokio::fs::write(&path, b"x").await.unwrap();

        let r = Reader::shared_disk(path.clone()).await.unwrap();
        r.finalize_consume().await.unwrap();
        assert!(!path.exists());
    }
}
