//! Wire types and Redis key surface shared by the Producer and Consumer.
//!
//! This crate owns the data model described in the system's data-model
//! section: the `Task`/`ScanResult` types, the pipe-delimited queue-element
//! encoding, and the Redis key naming scheme. It also re-exports the
//! generated external-processing gRPC types.

pub mod ext_proc {
    tonic::include_proto!("virusscan.ext_proc.v1");
}

pub mod keys;
pub mod wire;

pub use wire::{
    Mode, Priority, RequestMetadata, ScanMetrics, ScanResult, ScanStatus, Task, WireError,
};
