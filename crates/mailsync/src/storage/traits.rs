//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    ChangeId, ChangeRecord, DeleteSeq, FolderId, ItemId, ItemKind, MailItem, Placement,
    SyncToken, Tombstone, system,
};

/// Read handle on one mailbox's change log and tombstone log
///
/// Every method is a read-only query. Implementations must tolerate being
/// called while a writer appends: readers bound their scans with the
/// high-water mark they sampled, and appended records are never rewritten.
pub trait MailboxLogReader: Send + Sync {
    /// Highest change id and delete sequence recorded so far
    fn high_water_mark(&self) -> Result<SyncToken>;

    /// Change records with `after < change_id <= upto`, ascending, at most `max`
    ///
    /// Includes the last record of items that have since been deleted.
    fn changes_after(&self, after: ChangeId, upto: ChangeId, max: usize)
    -> Result<Vec<ChangeRecord>>;

    /// Tombstones with `after < delete_seq <= upto`, ascending, at most `max`
    fn tombstones_after(
        &self,
        after: DeleteSeq,
        upto: DeleteSeq,
        max: usize,
    ) -> Result<Vec<Tombstone>>;

    /// Get a live item by id
    fn get_item(&self, id: ItemId) -> Result<Option<MailItem>>;

    /// Get the tombstone of a deleted item
    fn get_tombstone(&self, id: ItemId) -> Result<Option<Tombstone>>;

    /// Container history of a live or deleted item, ordered by change id
    fn placements(&self, id: ItemId) -> Result<Vec<Placement>>;

    /// Live messages of a conversation
    fn conversation_members(&self, conversation: ItemId) -> Result<Vec<MailItem>>;

    /// All live folder-like items, including the root
    fn list_folders(&self) -> Result<Vec<MailItem>>;

    /// Live items other than folders held directly by `folder`
    fn items_in_folder(&self, folder: FolderId) -> Result<Vec<MailItem>>;
}

/// Write path of a mailbox
///
/// Each operation runs under the mailbox's single write lock and appends to
/// the logs: every item it touches receives a fresh change id, every item it
/// removes receives a tombstone with a fresh delete sequence.
pub trait MailboxWriter: Send + Sync {
    /// Create an item and return its stored state
    fn create(&self, item: NewItem) -> Result<MailItem>;

    /// Record a content or metadata change of an item
    fn touch(&self, id: ItemId) -> Result<MailItem>;

    /// Move an item to another folder
    fn move_item(&self, id: ItemId, folder: FolderId) -> Result<MailItem>;

    /// Delete an item, and everything it contains, returning the tombstones
    fn delete(&self, id: ItemId) -> Result<Vec<Tombstone>>;
}

/// Description of an item to create
#[derive(Debug, Clone)]
pub struct NewItem {
    pub kind: ItemKind,
    pub folder_id: FolderId,
    pub conversation_id: Option<ItemId>,
    pub name: Option<String>,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewItem {
    pub fn new(kind: ItemKind, folder_id: FolderId) -> Self {
        Self {
            kind,
            folder_id,
            conversation_id: None,
            name: None,
            subject: None,
            created_at: Utc::now(),
        }
    }

    /// A folder under `parent`
    pub fn folder(parent: FolderId, name: impl Into<String>) -> Self {
        Self::new(ItemKind::Folder, parent).name(name)
    }

    /// A tag; tags live in the tags folder
    pub fn tag(name: impl Into<String>) -> Self {
        Self::new(ItemKind::Tag, system::TAGS).name(name)
    }

    /// An empty conversation; conversations live in the conversations folder
    pub fn conversation(subject: impl Into<String>) -> Self {
        Self::new(ItemKind::Conversation, system::CONVERSATIONS).subject(subject)
    }

    /// A message delivered to `folder`
    pub fn message(folder: FolderId, subject: impl Into<String>) -> Self {
        Self::new(ItemKind::Message, folder).subject(subject)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn in_conversation(mut self, conversation: ItemId) -> Self {
        self.conversation_id = Some(conversation);
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}
