//! Background synchronization: the outbound queue drain and the inbound
//! change feed merge.

pub mod backoff;
pub mod engine;
pub mod listener;
pub mod status;

pub use backoff::Backoff;
pub use engine::{DrainReport, SyncEngine};
pub use listener::RealtimeMergeListener;
pub use status::{EngineProgress, SyncStatus};
