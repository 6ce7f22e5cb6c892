//! The HA-Update coordinator: a background task, one per Consumer process,
//! that keeps the local clamd engine on the cluster's `target_epoch` without
//! ever letting more than one node reload at a time. Runs on a
//! `tokio::time::interval` cadence and hands the currently-observed epoch to
//! the rest of the process over a `watch` channel, the same shape
//! `dekaf`'s task manager uses to publish state without a lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use virusscan_proto::keys::{KeySpace, HEARTBEAT_TTL_SECS, SCALING_REQUEST_TTL_SECS, UPDATE_LOCK_TTL_MS};
use virusscan_redis::RedisLike;

#[derive(Debug, thiserror::Error)]
pub enum HaError {
    #[error("redis error: {0}")]
    Redis(#[from] virusscan_redis::RedisError),
    #[error("clamd error: {0}")]
    Clamd(String),
}

/// The reload/ping surface the coordinator needs from clamd, narrowed to a
/// trait so the protocol logic can be tested without a real clamd.
#[async_trait::async_trait]
pub trait ReloadTarget: Send + Sync {
    async fn reload(&self) -> Result<(), HaError>;
    async fn ping(&self) -> Result<(), HaError>;
}

#[async_trait::async_trait]
impl ReloadTarget for virusscan_clamd::ClamdClient {
    async fn reload(&self) -> Result<(), HaError> {
        virusscan_clamd::ClamdClient::reload(self)
            .await
            .map_err(|e| HaError::Clamd(e.to_string()))
    }

    async fn ping(&self) -> Result<(), HaError> {
        virusscan_clamd::ClamdClient::ping(self)
            .await
            .map_err(|e| HaError::Clamd(e.to_string()))
    }
}

pub struct CoordinatorConfig {
    pub node_id: String,
    pub check_interval: Duration,
    pub reload_timeout: Duration,
    pub ping_poll_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        CoordinatorConfig {
            node_id: node_id.into(),
            check_interval: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(120),
            ping_poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Coordinator {
    redis: Arc<dyn RedisLike>,
    keys: KeySpace,
    clamd: Arc<dyn ReloadTarget>,
    config: CoordinatorConfig,
    epoch_tx: watch::Sender<String>,
}

impl Coordinator {
    pub fn new(redis: Arc<dyn RedisLike>, keys: KeySpace, clamd: Arc<dyn ReloadTarget>, config: CoordinatorConfig) -> Self {
        let (epoch_tx, _) = watch::channel(String::new());
        Coordinator {
            redis,
            keys,
            clamd,
            config,
            epoch_tx,
        }
    }

    /// Subscribe to the node's last-observed heartbeat epoch, e.g. for the
    /// `virusscan_reload_epoch` gauge.
    pub fn epoch_receiver(&self) -> watch::Receiver<String> {
        self.epoch_tx.subscribe()
    }

    /// Run the periodic protocol until cancelled. Errors from a single tick
    /// are logged and do not stop the loop — the next tick tries again.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "HA coordinator tick failed");
                    }
                }
            }
        }
    }

    /// One pass of the 8-step protocol (spec §4.F). Returns early (a no-op)
    /// at any step that defers to a later tick.
    pub async fn tick(&self) -> Result<(), HaError> {
        let heartbeat_key = self.keys.heartbeat(&self.config.node_id);

        // Step 1: compare target epoch against our own last-recorded one.
        let target = self.redis.get(&self.keys.target_epoch()).await?;
        let Some(target) = target.map(|v| String::from_utf8_lossy(&v).into_owned()) else {
            return Ok(());
        };
        let own = self
            .redis
            .get(&heartbeat_key)
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned());
        self.epoch_tx.send_replace(own.clone().unwrap_or_default());
        if own.as_deref() == Some(target.as_str()) {
            return Ok(());
        }

        // Step 2: a lone node cannot afford to go dark mid-reload; ask for
        // a surge replica and retry on a later tick instead of reloading now.
        let replica_count = self.redis.keys(&self.keys.heartbeat_glob()).await?.len();
        if replica_count <= 1 {
            self.redis
                .set(
                    &self.keys.scaling_request(),
                    b"1".to_vec(),
                    Some(SCALING_REQUEST_TTL_SECS),
                )
                .await?;
            return Ok(());
        }

        // Step 3: at most one node reloads cluster-wide.
        let lock_key = self.keys.update_lock();
        let acquired = self
            .redis
            .set_nx_px(&lock_key, &self.config.node_id, UPDATE_LOCK_TTL_MS)
            .await?;
        if !acquired {
            return Ok(());
        }

        // Step 4: extend the lock for as long as the reload actually takes.
        let watchdog_cancel = CancellationToken::new();
        let watchdog = {
            let redis = self.redis.clone();
            let lock_key = lock_key.clone();
            let cancel = watchdog_cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                interval.tick().await; // consume the immediate first tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = redis.pexpire(&lock_key, UPDATE_LOCK_TTL_MS).await {
                                tracing::warn!(error = %err, "failed to extend update_lock TTL");
                            }
                        }
                    }
                }
            })
        };

        let reload_result = self.reload_and_wait().await;
        watchdog_cancel.cancel();
        let _ = watchdog.await;
        let reload_succeeded = reload_result.is_ok();

        match reload_result {
            Ok(()) => {
                // Step 6: only a verified PING earns a heartbeat update.
                self.redis
                    .set(&heartbeat_key, target.clone().into_bytes(), Some(HEARTBEAT_TTL_SECS))
                    .await?;
                self.epoch_tx.send_replace(target.clone());
            }
            Err(err) => {
                self.redis
                    .set(
                        &self.keys.update_status(&self.config.node_id),
                        format!("ERROR: {err}").into_bytes(),
                        Some(HEARTBEAT_TTL_SECS),
                    )
                    .await?;
            }
        }

        // Step 7: release the lock whether or not the reload succeeded —
        // holding it past our own attempt only delays another node's retry.
        self.redis.cas_del(&lock_key, &self.config.node_id).await?;

        if reload_succeeded {
            // Step 8: last node to converge clears the surge request.
            if self.all_heartbeats_match(&target).await? {
                self.redis.del(&self.keys.scaling_request()).await?;
            }
        }

        Ok(())
    }

    async fn reload_and_wait(&self) -> Result<(), HaError> {
        self.clamd.reload().await?;
        let deadline = tokio::time::Instant::now() + self.config.reload_timeout;
        loop {
            if self.clamd.ping().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HaError::Clamd("reload_timeout exceeded waiting for PING".into()));
            }
            tokio::time::sleep(self.config.ping_poll_interval).await;
        }
    }

    async fn all_heartbeats_match(&self, target: &str) -> Result<bool, HaError> {
        let keys = self.redis.keys(&self.keys.heartbeat_glob()).await?;
        for key in keys {
            let value = self.redis.get(&key).await?;
            let value = value.map(|v| String::from_utf8_lossy(&v).into_owned());
            if value.as_deref() != Some(target) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use virusscan_redis::fake::FakeRedis;

    struct AlwaysHealthy;

    #[async_trait::async_trait]
    impl ReloadTarget for AlwaysHealthy {
        async fn reload(&self) -> Result<(), HaError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), HaError> {
            Ok(())
        }
    }

    struct NeverRecovers;

    #[async_trait::async_trait]
    impl ReloadTarget for NeverRecovers {
        async fn reload(&self) -> Result<(), HaError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), HaError> {
            Err(HaError::Clamd("engine still loading".into()))
        }
    }

    fn fast_config(node_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: node_id.to_string(),
            check_interval: Duration::from_millis(10),
            reload_timeout: Duration::from_millis(50),
            ping_poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn no_op_when_target_epoch_unset() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(AlwaysHealthy), fast_config("node-a"));
        coord.tick().await.unwrap();
        assert!(redis.get(&keys.update_lock()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_op_when_already_on_target_epoch() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v2".to_vec(), Some(30)).await.unwrap();
        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(AlwaysHealthy), fast_config("node-a"));
        coord.tick().await.unwrap();
        assert!(redis.get(&keys.update_lock()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lone_node_requests_a_surge_replica_instead_of_reloading() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v1".to_vec(), Some(30)).await.unwrap();
        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(AlwaysHealthy), fast_config("node-a"));
        coord.tick().await.unwrap();

        assert!(redis.get(&keys.scaling_request()).await.unwrap().is_some());
        assert!(redis.get(&keys.update_lock()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_reload_updates_heartbeat_and_releases_lock() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v1".to_vec(), Some(30)).await.unwrap();
        redis.set(&keys.heartbeat("node-b"), b"v1".to_vec(), Some(30)).await.unwrap();

        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(AlwaysHealthy), fast_config("node-a"));
        coord.tick().await.unwrap();

        let hb = redis.get(&keys.heartbeat("node-a")).await.unwrap().unwrap();
        assert_eq!(hb, b"v2");
        assert!(redis.get(&keys.update_lock()).await.unwrap().is_none());
        // node-b is still on v1, so the surge request (if any) is not cleared.
    }

    #[tokio::test]
    async fn scaling_request_clears_once_every_node_converges() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v1".to_vec(), Some(30)).await.unwrap();
        redis.set(&keys.heartbeat("node-b"), b"v2".to_vec(), Some(30)).await.unwrap();
        redis.set(&keys.scaling_request(), b"1".to_vec(), Some(300)).await.unwrap();

        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(AlwaysHealthy), fast_config("node-a"));
        coord.tick().await.unwrap();

        assert!(redis.get(&keys.scaling_request()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_reload_never_updates_heartbeat_but_still_releases_lock() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v1".to_vec(), Some(30)).await.unwrap();
        redis.set(&keys.heartbeat("node-b"), b"v1".to_vec(), Some(30)).await.unwrap();

        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(NeverRecovers), fast_config("node-a"));
        coord.tick().await.unwrap();

        let hb = redis.get(&keys.heartbeat("node-a")).await.unwrap().unwrap();
        assert_eq!(hb, b"v1", "heartbeat must never advance without a verified PING");
        assert!(redis.get(&keys.update_lock()).await.unwrap().is_none());
        assert!(redis.get(&keys.update_status("node-a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_node_backs_off_while_lock_is_held() {
        let redis: Arc<dyn RedisLike> = Arc::new(FakeRedis::new());
        let keys = KeySpace::new("vs");
        redis.set(&keys.target_epoch(), b"v2".to_vec(), None).await.unwrap();
        redis.set(&keys.heartbeat("node-a"), b"v1".to_vec(), Some(30)).await.unwrap();
        redis.set(&keys.heartbeat("node-b"), b"v1".to_vec(), Some(30)).await.unwrap();
        redis
            .set_nx_px(&keys.update_lock(), "node-a", UPDATE_LOCK_TTL_MS)
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl ReloadTarget for Counting {
            async fn reload(&self) -> Result<(), HaError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn ping(&self) -> Result<(), HaError> {
                Ok(())
            }
        }

        let coord = Coordinator::new(redis.clone(), keys.clone(), Arc::new(Counting(calls.clone())), fast_config("node-b"));
        coord.tick().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "node-b must not reload while node-a holds the lock");
    }
}
