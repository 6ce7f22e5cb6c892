//! Redis key surface (see spec §6). All keys are plain `String`s built from
//! a configurable prefix so multiple deployments can share one Redis
//! instance without a dedicated database per environment.

use uuid::Uuid;

pub const DEFAULT_PREFIX: &str = "virusscan";

pub const RESULT_TTL_SECS: i64 = 60;
pub const CACHE_TTL_SECS: i64 = 3600;
pub const HEARTBEAT_TTL_SECS: i64 = 30;
pub const HEARTBEAT_REFRESH_SECS: u64 = 10;
pub const INLINE_TTL_SECS: i64 = 60;
pub const SCALING_REQUEST_TTL_SECS: i64 = 300;
pub const UPDATE_LOCK_TTL_MS: i64 = 120_000;

#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        KeySpace::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeySpace {
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub fn scan_priority(&self) -> String {
        self.key("scan_priority")
    }

    pub fn scan_normal(&self) -> String {
        self.key("scan_normal")
    }

    pub fn result(&self, task_id: Uuid) -> String {
        self.key(format_args!("result:{task_id}"))
    }

    pub fn chunks(&self, task_id: Uuid) -> String {
        self.key(format_args!("chunks:{task_id}"))
    }

    pub fn chunks_done(&self, task_id: Uuid) -> String {
        self.key(format_args!("chunks:{task_id}:done"))
    }

    pub fn chunks_verified(&self, task_id: Uuid) -> String {
        self.key(format_args!("chunks:{task_id}:verified"))
    }

    pub fn inline(&self, task_id: Uuid) -> String {
        self.key(format_args!("inline:{task_id}"))
    }

    pub fn cache_verdict(&self, fingerprint: &str) -> String {
        self.key(format_args!("cache:verdict:{fingerprint}"))
    }

    pub fn heartbeat(&self, node_id: &str) -> String {
        self.key(format_args!("clamav:heartbeat:{node_id}"))
    }

    pub fn heartbeat_glob(&self) -> String {
        self.key("clamav:heartbeat:*")
    }

    pub fn target_epoch(&self) -> String {
        self.key("clamav:target_epoch")
    }

    pub fn update_lock(&self) -> String {
        self.key("clamav:update_lock")
    }

    pub fn scaling_request(&self) -> String {
        self.key("clamav:scaling_request")
    }

    /// Where a node records why its last reload attempt failed. Read by
    /// operators, not by other nodes — the cluster otherwise just stays on
    /// the old epoch until someone looks.
    pub fn update_status(&self, node_id: &str) -> String {
        self.key(format_args!("clamav:update_status:{node_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let ks = KeySpace::new("vs-test");
        assert_eq!(ks.scan_priority(), "vs-test:scan_priority");
        assert_eq!(ks.target_epoch(), "vs-test:clamav:target_epoch");
        let id = Uuid::nil();
        assert_eq!(ks.result(id), format!("vs-test:result:{id}"));
        assert_eq!(ks.chunks_done(id), format!("vs-test:chunks:{id}:done"));
    }
}
