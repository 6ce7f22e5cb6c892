//! An in-memory `RedisLike` fake, so the queue/cache/HA logic can be unit
//! tested without a live Redis. Blocking ops poll on a short interval
//! rather than using real server-side blocking — adequate for tests, never
//! used outside `#[cfg(test)]` code.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{Popped, RedisError, RedisLike};

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    values: HashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl State {
    fn expire_values(&mut self) {
        let now = Instant::now();
        self.values.retain(|_, (_, expiry)| match expiry {
            Some(at) => *at > now,
            None => true,
        });
    }
}

pub struct FakeRedis {
    state: Mutex<State>,
    poll_interval: Duration,
}

impl Default for FakeRedis {
    fn default() -> Self {
        FakeRedis {
            state: Mutex::new(State::default()),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        state.expire_values();
        f(&mut state)
    }
}

#[async_trait]
impl RedisLike for FakeRedis {
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError> {
        self.with_state(|s| s.lists.entry(key.to_string()).or_default().push_front(value));
        Ok(())
    }

    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError> {
        self.with_state(|s| s.lists.entry(key.to_string()).or_default().push_back(value));
        Ok(())
    }

    async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<Popped>, RedisError> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = self.with_state(|s| {
                for key in keys {
                    if let Some(list) = s.lists.get_mut(*key) {
                        if let Some(value) = list.pop_back() {
                            return Some(Popped {
                                key: key.to_string(),
                                value,
                            });
                        }
                    }
                }
                None
            });
            if let Some(popped) = popped {
                return Ok(Some(popped));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn blmove(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, RedisError> {
        let deadline = Instant::now() + timeout;
        loop {
            let moved = self.with_state(|s| {
                let value = s.lists.get_mut(src).and_then(VecDeque::pop_front);
                if let Some(value) = value.clone() {
                    s.lists.entry(dst.to_string()).or_default().push_back(value);
                }
                value
            });
            if moved.is_some() {
                return Ok(moved);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RedisError> {
        Ok(self.with_state(|s| s.values.get(key).map(|(v, _)| v.clone())))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ex_secs: Option<i64>) -> Result<(), RedisError> {
        let expiry = ex_secs.map(|secs| Instant::now() + Duration::from_secs(secs.max(0) as u64));
        self.with_state(|s| {
            s.values.insert(key.to_string(), (value, expiry));
        });
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool, RedisError> {
        let expiry = Instant::now() + Duration::from_millis(ttl_ms.max(0) as u64);
        Ok(self.with_state(|s| {
            if s.values.contains_key(key) {
                false
            } else {
                s.values
                    .insert(key.to_string(), (value.as_bytes().to_vec(), Some(expiry)));
                true
            }
        }))
    }

    async fn expire(&self, key: &str, secs: i64) -> Result<bool, RedisError> {
        let expiry = Instant::now() + Duration::from_secs(secs.max(0) as u64);
        Ok(self.with_state(|s| {
            if let Some(entry) = s.values.get_mut(key) {
                entry.1 = Some(expiry);
                true
            } else {
                false
            }
        }))
    }

    async fn pexpire(&self, key: &str, ms: i64) -> Result<bool, RedisError> {
        self.expire(key, ms / 1000).await
    }

    async fn del(&self, key: &str) -> Result<(), RedisError> {
        self.with_state(|s| {
            s.values.remove(key);
            s.lists.remove(key);
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, RedisError> {
        Ok(self.with_state(|s| {
            s.values.contains_key(key) || s.lists.get(key).is_some_and(|l| !l.is_empty())
        }))
    }

    async fn llen(&self, key: &str) -> Result<i64, RedisError> {
        Ok(self.with_state(|s| s.lists.get(key).map(|l| l.len() as i64).unwrap_or(0)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RedisError> {
        let prefix = pattern.trim_end_matches('*');
        Ok(self.with_state(|s| {
            s.values
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }

    async fn cas_del(&self, key: &str, expected: &str) -> Result<bool, RedisError> {
        Ok(self.with_state(|s| {
            let matches = s
                .values
                .get(key)
                .map(|(v, _)| v.as_slice() == expected.as_bytes())
                .unwrap_or(false);
            if matches {
                s.values.remove(key);
            }
            matches
        }))
    }
}
