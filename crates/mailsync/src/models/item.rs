//! Mail item model: identifiers, kinds and container history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ChangeId;

/// Unique identifier for an item within one mailbox
///
/// Ids are allocated from a monotonic counter and never reused, so an id
/// that has been tombstoned can never reappear as a live item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Containers are items too; the alias documents intent at call sites
pub type FolderId = ItemId;

/// Well-known system folders, created when a mailbox is bootstrapped
pub mod system {
    use super::ItemId;

    pub const ROOT: ItemId = ItemId(1);
    pub const INBOX: ItemId = ItemId(2);
    pub const TRASH: ItemId = ItemId(3);
    pub const JUNK: ItemId = ItemId(4);
    pub const SENT: ItemId = ItemId(5);
    pub const DRAFTS: ItemId = ItemId(6);
    pub const CONTACTS: ItemId = ItemId(7);
    pub const TAGS: ItemId = ItemId(8);
    pub const CONVERSATIONS: ItemId = ItemId(9);
    pub const CALENDAR: ItemId = ItemId(10);

    /// First id handed out to user-created items
    pub const FIRST_USER_ID: i64 = 256;

    /// (id, name) of every system folder other than the root
    pub const FOLDERS: [(ItemId, &str); 9] = [
        (INBOX, "Inbox"),
        (TRASH, "Trash"),
        (JUNK, "Junk"),
        (SENT, "Sent"),
        (DRAFTS, "Drafts"),
        (CONTACTS, "Contacts"),
        (TAGS, "Tags"),
        (CONVERSATIONS, "Conversations"),
        (CALENDAR, "Calendar"),
    ];
}

/// The kind of a mail item
///
/// Id spaces are shared across kinds, so deletions always carry the kind
/// alongside the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Folder,
    SearchFolder,
    Mountpoint,
    Tag,
    Conversation,
    Message,
    Contact,
    Appointment,
    Task,
    Document,
    Note,
    Chat,
}

impl ItemKind {
    pub const ALL: [ItemKind; 12] = [
        ItemKind::Folder,
        ItemKind::SearchFolder,
        ItemKind::Mountpoint,
        ItemKind::Tag,
        ItemKind::Conversation,
        ItemKind::Message,
        ItemKind::Contact,
        ItemKind::Appointment,
        ItemKind::Task,
        ItemKind::Document,
        ItemKind::Note,
        ItemKind::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Folder => "folder",
            ItemKind::SearchFolder => "search",
            ItemKind::Mountpoint => "link",
            ItemKind::Tag => "tag",
            ItemKind::Conversation => "conversation",
            ItemKind::Message => "message",
            ItemKind::Contact => "contact",
            ItemKind::Appointment => "appointment",
            ItemKind::Task => "task",
            ItemKind::Document => "document",
            ItemKind::Note => "note",
            ItemKind::Chat => "chat",
        }
    }

    /// Folder-like items occupy a place in the folder hierarchy
    pub fn is_folder_like(&self) -> bool {
        matches!(
            self,
            ItemKind::Folder | ItemKind::SearchFolder | ItemKind::Mountpoint
        )
    }

    /// Only real folders can hold other items
    pub fn is_container(&self) -> bool {
        matches!(self, ItemKind::Folder)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown item kind: {}", s))
    }
}

/// One entry of an item's container history
///
/// A placement is recorded when the item is created and every time it is
/// moved. For folder-like items the container is the parent folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub change_id: ChangeId,
    pub folder_id: FolderId,
}

impl Placement {
    pub fn new(change_id: ChangeId, folder_id: FolderId) -> Self {
        Self {
            change_id,
            folder_id,
        }
    }
}

/// Container an item occupied as of `change_id`
///
/// `placements` must be ordered by change id. Returns `None` when the item
/// did not exist yet at that point of the change log.
pub fn folder_at(placements: &[Placement], change_id: ChangeId) -> Option<FolderId> {
    placements
        .iter()
        .take_while(|p| p.change_id <= change_id)
        .last()
        .map(|p| p.folder_id)
}

/// The current state of a live item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailItem {
    pub id: ItemId,
    pub kind: ItemKind,
    /// Container of the item; the parent folder for folder-like items
    pub folder_id: FolderId,
    /// Conversation a message belongs to, if any
    #[serde(default)]
    pub conversation_id: Option<ItemId>,
    /// Change id of the latest mutation of this item
    pub change_id: ChangeId,
    /// Change id at which the item was created
    pub created_change: ChangeId,
    /// Creation (for messages: receipt) time
    pub created_at: DateTime<Utc>,
    /// Display name of folders, tags and documents
    #[serde(default)]
    pub name: Option<String>,
    /// Subject of messages and conversations
    #[serde(default)]
    pub subject: Option<String>,
}

impl MailItem {
    /// A system folder as it exists in a freshly bootstrapped mailbox
    pub fn system_folder(id: FolderId, name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: ItemKind::Folder,
            folder_id: system::ROOT,
            conversation_id: None,
            change_id: 0,
            created_change: 0,
            created_at,
            name: Some(name.to_string()),
            subject: None,
        }
    }

    /// The root folder, which is its own parent
    pub fn root_folder(created_at: DateTime<Utc>) -> Self {
        Self::system_folder(system::ROOT, "", created_at)
    }

    pub fn is_root(&self) -> bool {
        self.id == system::ROOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_at_follows_history() {
        let history = vec![
            Placement::new(3, system::INBOX),
            Placement::new(7, system::TRASH),
            Placement::new(12, system::SENT),
        ];

        assert_eq!(folder_at(&history, 2), None);
        assert_eq!(folder_at(&history, 3), Some(system::INBOX));
        assert_eq!(folder_at(&history, 6), Some(system::INBOX));
        assert_eq!(folder_at(&history, 7), Some(system::TRASH));
        assert_eq!(folder_at(&history, 100), Some(system::SENT));
    }

    #[test]
    fn test_folder_at_empty_history() {
        assert_eq!(folder_at(&[], 10), None);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in ItemKind::ALL {
            assert_eq!(kind.as_str().parse::<ItemKind>().unwrap(), kind);
        }
        assert!("widget".parse::<ItemKind>().is_err());
    }

    #[test]
    fn test_folder_like_kinds() {
        assert!(ItemKind::Folder.is_folder_like());
        assert!(ItemKind::Mountpoint.is_folder_like());
        assert!(!ItemKind::Mountpoint.is_container());
        assert!(!ItemKind::Message.is_folder_like());
    }
}
