use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use virusscan_proto::keys::{KeySpace, INLINE_TTL_SECS};

use crate::{SharedRedis, MAX_CHUNK_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("redis error: {0}")]
    Redis(#[from] virusscan_redis::RedisError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk of {0} bytes exceeds the {MAX_CHUNK_BYTES}-byte STREAM chunk limit")]
    ChunkTooLarge(usize),
}

/// Producer-side half of a `DataProvider`: accepts pushed bytes and, on
/// `finalize`, makes the body visible to whichever Consumer pops the task.
pub enum Writer {
    Inline {
        redis: SharedRedis,
        key: String,
        body: Vec<u8>,
    },
    Stream {
        redis: SharedRedis,
        chunks_key: String,
        done_key: String,
    },
    SharedDisk {
        path: PathBuf,
        file: tokio::fs::File,
    },
}

impl Writer {
    pub fn inline(redis: SharedRedis, keys: &KeySpace, task_id: Uuid) -> Self {
        Writer::Inline {
            redis,
            key: keys.inline(task_id),
            body: Vec::new(),
        }
    }

    pub fn stream(redis: SharedRedis, keys: &KeySpace, task_id: Uuid) -> Self {
        Writer::Stream {
            redis,
            chunks_key: keys.chunks(task_id),
            done_key: keys.chunks_done(task_id),
        }
    }

    pub async fn shared_disk(dir: &std::path::Path, task_id: Uuid) -> Result<Self, WriterError> {
        let path = dir.join(task_id.to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(Writer::SharedDisk { path, file })
    }

    /// The content_ref that should be recorded in the task's wire header
    /// for this provider instance.
    pub fn content_ref(&self) -> String {
        match self {
            Writer::Inline { key, .. } => key.clone(),
            Writer::Stream { chunks_key, .. } => chunks_key.clone(),
            Writer::SharedDisk { path, .. } => path.display().to_string(),
        }
    }

    pub async fn push(&mut self, chunk: &[u8]) -> Result<(), WriterError> {
        match self {
            Writer::Inline { body, .. } => {
                body.extend_from_slice(chunk);
                Ok(())
            }
            Writer::Stream {
                redis, chunks_key, ..
            } => {
                if chunk.len() > MAX_CHUNK_BYTES {
                    return Err(WriterError::ChunkTooLarge(chunk.len()));
                }
                redis.rpush(chunks_key, chunk.to_vec()).await?;
                Ok(())
            }
            Writer::SharedDisk { file, .. } => {
                file.write_all(chunk).await?;
                Ok(())
            }
        }
    }

    pub async fn finalize(self) -> Result<(), WriterError> {
        match self {
            Writer::Inline { redis, key, body } => {
                redis.set(&key, body, Some(INLINE_TTL_SECS)).await?;
                Ok(())
            }
            Writer::Stream {
                redis, done_key, ..
            } => {
                redis.set(&done_key, b"1".to_vec(), None).await?;
                Ok(())
            }
            Writer::SharedDisk { mut file, .. } => {
                file.flush().await?;
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

    #[tokio::test]
    async fn inline_writer_buffers_then_sets_on_finalize() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let task_id = Uuid::new_v4();
        let mut w = Writer::inline(redis.clone(), &keys, task_id);
        w.push(b"hello ").await.unwrap();
        w.push(b"world").await.unwrap();
        w.finalize().await.unwrap();

        let stored = redis.get(&keys.inline(task_id)).await.unwrap().unwrap();
        assert_eq!(stored, b"hello world");
    }

    #[tokio::test]
    async fn stream_writer_pushes_chunks_and_sets_done_sentinel() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let task_id = Uuid::new_v4();
        let mut w = Writer::stream(redis.clone(), &keys, task_id);
        w.push(b"chunk-a").await.unwrap();
        w.push(b"chunk-b").await.unwrap();
        w.finalize().await.unwrap();

        assert_eq!(redis.llen(&keys.chunks(task_id)).await.unwrap(), 2);
        let done = redis.get(&keys.chunks_done(task_id)).await.unwrap().unwrap();
        assert_eq!(done, b"1");
    }

    #[tokio::test]
    async fn stream_writer_rejects_oversize_chunk() {
        let redis: SharedRedis = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let mut w = Writer::stream(redis, &keys, Uuid::new_v4());
        let oversize = vec![0u8; MAX_CHUNK_BYTES + 1];
        let err = w.push(&oversize).await.unwrap_err();
        assert!(matches!(err, WriterError::ChunkTooLarge(_)));
    }

    #[tokio::test]
    async fn shared_disk_writer_writes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let mut w = Writer::shared_disk(dir.path(), task_id).await.unwrap();
        w.push(b"payload").await.unwrap();
        let content_ref = w.content_ref();
        w.finalize().await.unwrap();

        let on_disk = tokio::fs::read(&content_ref).await.unwrap();
        assert_eq!(on_disk, b"payload");
    }
}
