use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue a task is pushed onto. Priority is strict: a non-empty
/// `scan_priority` list always preempts `scan_normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    pub fn from_header_value(v: Option<&str>) -> Priority {
        match v {
            Some(v) if v.eq_ignore_ascii_case("high") => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        })
    }
}

/// The DataProvider variant a task was enqueued with. Encoded verbatim into
/// the queue-element wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inline,
    Stream,
    /// Body lives on the shared RWX volume; wire header encodes it as
    /// `PATH` per spec §3 (`mode ∈ {INLINE, STREAM, PATH}`).
    SharedDisk,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Inline => "INLINE",
            Mode::Stream => "STREAM",
            Mode::SharedDisk => "PATH",
        })
    }
}

impl FromStr for Mode {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INLINE" => Ok(Mode::Inline),
            "STREAM" => Ok(Mode::Stream),
            "PATH" => Ok(Mode::SharedDisk),
            other => Err(WireError::UnknownMode(other.to_string())),
        }
    }
}

/// Origin/content metadata carried alongside a `Task` for logging and cache
/// lookups. Never serialized onto the wire: the Producer process that
/// enqueues a task is the same process that later awaits its verdict, so
/// this never needs to cross the Redis boundary.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub origin_uri: String,
    pub content_type: Option<String>,
    pub tenant_id: Option<String>,
}

/// A scan request, as tracked by the Producer and reconstructed by the
/// Consumer from the queue-element wire header.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: Uuid,
    pub priority: Priority,
    pub mode: Mode,
    pub push_time_ns: u128,
    pub content_ref: String,
    pub request_metadata: Option<RequestMetadata>,
}

impl Task {
    pub fn new(
        priority: Priority,
        mode: Mode,
        push_time_ns: u128,
        content_ref: impl Into<String>,
    ) -> Self {
        Task {
            task_id: Uuid::new_v4(),
            priority,
            mode,
            push_time_ns,
            content_ref: content_ref.into(),
            request_metadata: None,
        }
    }

    /// Encode the queue-element wire header:
    /// `task_id|MODE|push_time_ns|content_ref`. Binary data never appears
    /// here — only the reference to where it lives.
    pub fn encode_header(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.task_id, self.mode, self.push_time_ns, self.content_ref
        )
    }

    /// Parse a queue-element wire header. Used by the Consumer after
    /// `BRPOP`.
    pub fn parse_header(raw: &str) -> Result<ParsedHeader, WireError> {
        let mut parts = raw.splitn(4, '|');
        let task_id = parts.next().ok_or(WireError::Malformed)?;
        let mode = parts.next().ok_or(WireError::Malformed)?;
        let push_time_ns = parts.next().ok_or(WireError::Malformed)?;
        let content_ref = parts.next().ok_or(WireError::Malformed)?;

        let task_id = Uuid::parse_str(task_id).map_err(|_| WireError::Malformed)?;
        let mode: Mode = mode.parse()?;
        let push_time_ns: u128 = push_time_ns.parse().map_err(|_| WireError::Malformed)?;

        Ok(ParsedHeader {
            task_id,
            mode,
            push_time_ns,
            content_ref: content_ref.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub task_id: Uuid,
    pub mode: Mode,
    pub push_time_ns: u128,
    pub content_ref: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed queue-element header")]
    Malformed,
    #[error("unknown DataProvider mode {0:?}")]
    UnknownMode(String),
}

/// Verdict returned by the Consumer for a `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    Clean,
    Infected,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanMetrics {
    pub scan_ms: i64,
    pub total_tat_ms: i64,
}

/// JSON object stored at `result:<task_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_key: Option<String>,
    pub metrics: ScanMetrics,
}

impl ScanResult {
    pub fn clean(metrics: ScanMetrics, data_key: Option<String>) -> Self {
        ScanResult {
            status: ScanStatus::Clean,
            virus: None,
            data_key,
            metrics,
        }
    }

    pub fn infected(virus: impl Into<String>, metrics: ScanMetrics) -> Self {
        ScanResult {
            status: ScanStatus::Infected,
            virus: Some(virus.into()),
            data_key: None,
            metrics,
        }
    }

    pub fn error(metrics: ScanMetrics) -> Self {
        ScanResult {
            status: ScanStatus::Error,
            virus: None,
            data_key: None,
            metrics,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ScanResult always serializes")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
