//! Change log and tombstone log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{FolderId, ItemId, ItemKind, Placement, folder_at};
use super::{ChangeId, DeleteSeq};

/// "Item X is now at change N"
///
/// The change log keeps one record per item: a later mutation replaces the
/// earlier record, so the log never describes intermediate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub item_id: ItemId,
    pub kind: ItemKind,
    pub change_id: ChangeId,
}

/// Durable record that an item was deleted
///
/// Retains the item's container history so scope can be evaluated against
/// the container a client last saw the item in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub item_id: ItemId,
    pub kind: ItemKind,
    pub delete_seq: DeleteSeq,
    /// Change id at which the deleted item had been created
    pub created_change: ChangeId,
    /// Container history of the item up to its deletion
    pub placements: Vec<Placement>,
    /// For conversations: folders of the member messages at delete time
    #[serde(default)]
    pub member_folders: Vec<FolderId>,
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    /// Container the item occupied as of `change_id`, if it existed then
    pub fn folder_at(&self, change_id: ChangeId) -> Option<FolderId> {
        folder_at(&self.placements, change_id)
    }

    /// Container the item occupied when it was deleted
    pub fn final_folder(&self) -> Option<FolderId> {
        self.placements.last().map(|p| p.folder_id)
    }
}
