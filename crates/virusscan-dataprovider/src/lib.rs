//! The `DataProvider` family (spec §4.A): a uniform push/pull capability
//! set over three transports. Modeled as a tagged enum rather than a
//! trait object — there is a fixed, small set of variants and no runtime
//! extension point, matching the teacher's "no open registry needed"
//! design note.
//!
//! The producer side (`Writer`) and consumer side (`Reader`) are separate
//! types because they run in different processes with different
//! lifetimes; both share the same `Mode` selection policy.

mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::{Writer, WriterError};

use std::sync::Arc;

use virusscan_proto::Mode;
use virusscan_redis::RedisLike;

/// Maximum size of a single STREAM chunk (spec §3).
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Absolute cap on ingest body size (spec §7.3); bodies beyond this are
/// rejected by the Producer with 413 before any provider is selected.
pub const ABSOLUTE_MAX_BODY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Inputs to the provider selection policy (spec §4.A "Selection policy").
pub struct SelectionInput {
    /// Bytes buffered so far (or the full body length, if known up front).
    pub body_len: u64,
    /// In-memory buffering threshold, above which STREAM/SHARED_DISK is used.
    pub inline_threshold_bytes: u64,
    /// Whether a shared RWX volume is configured for this deployment.
    pub shared_disk_configured: bool,
}

/// Choose a `Mode` for a task. Preference order: STREAM first (bounded
/// memory, no shared volume required), then SHARED_DISK once the body
/// exceeds the in-memory threshold and a shared volume exists, else
/// INLINE.
pub fn select_mode(input: &SelectionInput) -> Mode {
    if input.body_len <= input.inline_threshold_bytes {
        Mode::Inline
    } else if input.shared_disk_configured {
        Mode::SharedDisk
    } else {
        Mode::Stream
    }
}

pub type SharedRedis = Arc<dyn RedisLike>;
