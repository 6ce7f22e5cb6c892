//! Library surface for the Producer binary, split out so integration tests
//! can drive `IcapServer`/`ExtProcService` directly against a live Redis and
//! clamd, the same way `virusscan-consumer` exposes its `Worker`.

pub mod ext_proc;
pub mod icap;
pub mod state_machine;

pub use ext_proc::ExtProcService;
pub use icap::{IcapError, IcapServer};
pub use state_machine::{Decision, Session, SessionConfig, SessionError};
