//! Result types of a sync request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{FolderId, ItemId, ItemKind, MailItem};
use super::token::SyncToken;
use super::ChangeId;

/// Client-facing summary of a created or modified item
///
/// Carries enough for the client to upsert locally; full content is fetched
/// out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub kind: ItemKind,
    pub folder_id: FolderId,
    /// Modification marker: the change id of the item's latest mutation
    pub change_id: ChangeId,
    /// True when the item was created after the client's cursor
    pub created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Receipt date, for messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl ItemSummary {
    /// Summarize `item` for a client whose change cursor is `since`
    pub fn from_item(item: &MailItem, since: ChangeId) -> Self {
        let is_message = item.kind == ItemKind::Message;
        Self {
            id: item.id,
            kind: item.kind,
            folder_id: item.folder_id,
            change_id: item.change_id,
            created: item.created_change > since,
            conversation_id: item.conversation_id,
            name: item.name.clone(),
            subject: item.subject.clone(),
            date: is_message.then_some(item.created_at),
        }
    }
}

/// An entity the client must purge locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletedItem {
    pub id: ItemId,
    pub kind: ItemKind,
}

impl DeletedItem {
    pub fn new(id: ItemId, kind: ItemKind) -> Self {
        Self { id, kind }
    }
}

/// One bounded slice of a delta sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPage {
    pub items: Vec<ItemSummary>,
    pub deleted: Vec<DeletedItem>,
    pub new_token: SyncToken,
    /// Whether another call with `new_token` will yield further results
    pub more: bool,
}

impl SyncPage {
    /// A page with nothing in it, leaving the cursor at `token`
    pub fn empty(token: SyncToken) -> Self {
        Self {
            items: Vec::new(),
            deleted: Vec::new(),
            new_token: token,
            more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deleted.is_empty()
    }
}
