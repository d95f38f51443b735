//! Domain models for the sync subsystem

mod change;
mod item;
mod page;
mod token;

/// Position in a mailbox's change log
pub type ChangeId = i64;

/// Position in a mailbox's tombstone log
pub type DeleteSeq = i64;

pub use change::{ChangeRecord, Tombstone};
pub use item::{FolderId, ItemId, ItemKind, MailItem, Placement, folder_at, system};
pub use page::{DeletedItem, ItemSummary, SyncPage};
pub use token::{NO_DELETES, SyncToken};
