//! Mailsync crate - incremental mailbox synchronization
//!
//! Given a client's last sync token, this crate returns exactly the changes
//! (created or modified items, and deletions) made to a mailbox since that
//! token, in bounded pages, without omitting or repeating anything across
//! restarts, concurrent writes and multi-page catch-up. It provides:
//! - Domain models (items, change records, tombstones, the two-part token)
//! - Storage traits for the change log and tombstone log, with in-memory and
//!   SQLite implementations
//! - The sync engine: scope filtering, page planning and snapshots
//!
//! Items are mutated elsewhere; the storage write path exists so the logs can
//! be populated under the single-writer rule.

pub mod config;
pub mod error;
pub mod models;
pub mod storage;
pub mod sync;

pub use crate::config::SyncConfig;
pub use error::SyncError;
pub use models::{
    ChangeId, ChangeRecord, DeleteSeq, DeletedItem, FolderId, ItemId, ItemKind, ItemSummary,
    MailItem, Placement, SyncPage, SyncToken, Tombstone, system,
};
pub use storage::{InMemoryMailbox, MailboxLogReader, MailboxWriter, NewItem, SqliteMailbox};
pub use sync::{
    PageLimits, ScopeFilter, SnapshotFolder, SyncRequest, SyncResponse, SyncService, plan,
};
