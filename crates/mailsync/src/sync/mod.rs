//! Incremental sync engine
//!
//! The service decodes the client's token and builds its scope, then either
//! snapshots the mailbox (no token) or plans the next delta page by scanning
//! the change log and the tombstone log independently.

pub mod log;
mod planner;
mod scope;
mod service;
mod snapshot;

pub use planner::{PageLimits, plan};
pub use scope::ScopeFilter;
pub use service::{SyncRequest, SyncResponse, SyncService};
pub use snapshot::{SnapshotFolder, snapshot};
