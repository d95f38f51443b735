//! Scope filter: which items a client may see
//!
//! A scope combines an optional folder subtree with an optional message
//! cutoff. Current items are judged by their current container; deleted
//! items are judged by the container they occupied at the client's change
//! cursor, which is the last state the client can have seen.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::error::SyncError;
use crate::models::{ChangeId, FolderId, ItemKind, MailItem, Tombstone, folder_at};
use crate::storage::MailboxLogReader;

/// Folder subtree and cutoff of one sync request
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    root: Option<FolderId>,
    /// The scope root and every live folder below it
    subtree: HashSet<FolderId>,
    /// Messages received before this time (epoch seconds) are invisible
    cutoff: Option<i64>,
    /// Deleted folders already resolved against the subtree
    vanished: HashMap<FolderId, bool>,
}

impl ScopeFilter {
    /// A filter that admits the whole mailbox
    pub fn unscoped(cutoff: Option<i64>) -> Self {
        Self {
            root: None,
            subtree: HashSet::new(),
            cutoff,
            vanished: HashMap::new(),
        }
    }

    /// Build the filter for a request
    ///
    /// Fails with [`SyncError::UnknownScope`] when `folder` does not name a
    /// live folder-like item.
    pub fn build(
        reader: &dyn MailboxLogReader,
        folder: Option<FolderId>,
        cutoff: Option<i64>,
    ) -> Result<Self, SyncError> {
        let Some(root) = folder else {
            return Ok(Self::unscoped(cutoff));
        };

        match reader.get_item(root)? {
            Some(item) if item.kind.is_folder_like() => {}
            _ => return Err(SyncError::UnknownScope { folder: root }),
        }

        let mut children: HashMap<FolderId, Vec<FolderId>> = HashMap::new();
        for folder in reader.list_folders()? {
            if !folder.is_root() {
                children.entry(folder.folder_id).or_default().push(folder.id);
            }
        }

        let mut subtree = HashSet::from([root]);
        let mut pending = vec![root];
        while let Some(current) = pending.pop() {
            for child in children.get(&current).into_iter().flatten() {
                if subtree.insert(*child) {
                    pending.push(*child);
                }
            }
        }

        Ok(Self {
            root: Some(root),
            subtree,
            cutoff,
            vanished: HashMap::new(),
        })
    }

    pub fn root(&self) -> Option<FolderId> {
        self.root
    }

    pub fn cutoff(&self) -> Option<i64> {
        self.cutoff
    }

    /// Whether `folder` is a live folder inside the subtree
    pub fn contains_folder(&self, folder: FolderId) -> bool {
        self.root.is_none() || self.subtree.contains(&folder)
    }

    fn placed_in_scope(&self, item: &MailItem) -> bool {
        self.root == Some(item.id) || self.contains_folder(item.folder_id)
    }

    /// Whether a message passes the cutoff; other kinds always do
    pub fn passes_cutoff(&self, item: &MailItem) -> bool {
        match (self.cutoff, item.kind) {
            (Some(cutoff), ItemKind::Message) => item.created_at.timestamp() >= cutoff,
            _ => true,
        }
    }

    /// Whether a live item belongs to the scope as it is now
    pub fn admit(&self, reader: &dyn MailboxLogReader, item: &MailItem) -> Result<bool> {
        Ok(match item.kind {
            ItemKind::Tag => true,
            ItemKind::Conversation => reader
                .conversation_members(item.id)?
                .iter()
                .any(|m| self.placed_in_scope(m) && self.passes_cutoff(m)),
            _ => self.placed_in_scope(item) && self.passes_cutoff(item),
        })
    }

    /// Whether `folder`, possibly deleted since, lay inside the subtree at
    /// change `at`
    pub fn folder_was_in_scope(
        &mut self,
        reader: &dyn MailboxLogReader,
        folder: FolderId,
        at: ChangeId,
    ) -> Result<bool> {
        if self.contains_folder(folder) {
            return Ok(true);
        }
        if let Some(known) = self.vanished.get(&folder) {
            return Ok(*known);
        }

        // guards against cycles while the ancestry is resolved
        self.vanished.insert(folder, false);

        let mut visible = false;
        if reader.get_item(folder)?.is_none()
            && let Some(tombstone) = reader.get_tombstone(folder)?
            && tombstone.kind.is_folder_like()
        {
            visible = match tombstone.folder_at(at) {
                Some(parent) => self.folder_was_in_scope(reader, parent, at)?,
                None => false,
            };
        }

        self.vanished.insert(folder, visible);
        Ok(visible)
    }

    /// Whether a client at change `at` may hold `item`, which the scope no
    /// longer admits
    ///
    /// True means the item left the scope after `at` and the client must be
    /// told to drop it. Conversations and tags never qualify. The cutoff is
    /// not consulted: deletions reach the client regardless of it.
    pub fn was_visible(
        &mut self,
        reader: &dyn MailboxLogReader,
        item: &MailItem,
        at: ChangeId,
    ) -> Result<bool> {
        if matches!(item.kind, ItemKind::Conversation | ItemKind::Tag) {
            return Ok(false);
        }
        if self.root.is_none() {
            return Ok(false);
        }
        match folder_at(&reader.placements(item.id)?, at) {
            Some(folder) => self.folder_was_in_scope(reader, folder, at),
            None => Ok(false),
        }
    }

    /// Whether a client at change `at` may hold the item behind `tombstone`
    pub fn tombstone_visible(
        &mut self,
        reader: &dyn MailboxLogReader,
        tombstone: &Tombstone,
        at: ChangeId,
    ) -> Result<bool> {
        if tombstone.created_change > at {
            return Ok(false);
        }
        match tombstone.kind {
            ItemKind::Tag => Ok(true),
            ItemKind::Conversation => {
                if self.root.is_none() {
                    return Ok(true);
                }
                for folder in &tombstone.member_folders {
                    if self.folder_was_in_scope(reader, *folder, at)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => match tombstone.folder_at(at) {
                Some(folder) => self.folder_was_in_scope(reader, folder, at),
                None => Ok(false),
            },
        }
    }

    /// Whether the final container of a deleted item lies inside the scope
    pub fn tombstone_ends_in_scope(
        &mut self,
        reader: &dyn MailboxLogReader,
        tombstone: &Tombstone,
        at: ChangeId,
    ) -> Result<bool> {
        match tombstone.final_folder() {
            Some(folder) => self.folder_was_in_scope(reader, folder, at),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::system;
    use crate::storage::{InMemoryMailbox, MailboxWriter, NewItem};
    use chrono::{Duration, Utc};

    #[test]
    fn test_unknown_scope() {
        let mbox = InMemoryMailbox::new();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();

        for folder in [crate::models::ItemId(999), msg.id] {
            let err = ScopeFilter::build(&mbox, Some(folder), None).unwrap_err();
            assert!(matches!(err, SyncError::UnknownScope { folder: f } if f == folder));
        }
    }

    #[test]
    fn test_subtree_admission() {
        let mbox = InMemoryMailbox::new();
        let work = mbox.create(NewItem::folder(system::ROOT, "Work")).unwrap();
        let sub = mbox.create(NewItem::folder(work.id, "Sub")).unwrap();
        let deep = mbox.create(NewItem::message(sub.id, "deep")).unwrap();
        let outside = mbox.create(NewItem::message(system::INBOX, "out")).unwrap();
        let tag = mbox.create(NewItem::tag("urgent")).unwrap();

        let scope = ScopeFilter::build(&mbox, Some(work.id), None).unwrap();
        assert!(scope.admit(&mbox, &work).unwrap());
        assert!(scope.admit(&mbox, &sub).unwrap());
        assert!(scope.admit(&mbox, &deep).unwrap());
        assert!(scope.admit(&mbox, &tag).unwrap());
        assert!(!scope.admit(&mbox, &outside).unwrap());
        let inbox = mbox.get_item(system::INBOX).unwrap().unwrap();
        assert!(!scope.admit(&mbox, &inbox).unwrap());
    }

    #[test]
    fn test_conversation_follows_members() {
        let mbox = InMemoryMailbox::new();
        let work = mbox.create(NewItem::folder(system::ROOT, "Work")).unwrap();
        let conv = mbox.create(NewItem::conversation("c")).unwrap();
        let old = Utc::now() - Duration::hours(2);
        mbox.create(
            NewItem::message(work.id, "c")
                .in_conversation(conv.id)
                .received_at(old),
        )
        .unwrap();

        let conv = mbox.get_item(conv.id).unwrap().unwrap();
        let scoped = ScopeFilter::build(&mbox, Some(work.id), None).unwrap();
        assert!(scoped.admit(&mbox, &conv).unwrap());

        let inbox_only = ScopeFilter::build(&mbox, Some(system::INBOX), None).unwrap();
        assert!(!inbox_only.admit(&mbox, &conv).unwrap());

        let recent = ScopeFilter::unscoped(Some(Utc::now().timestamp() - 60));
        assert!(!recent.admit(&mbox, &conv).unwrap());
    }

    #[test]
    fn test_cutoff_only_applies_to_messages() {
        let mbox = InMemoryMailbox::new();
        let old = Utc::now() - Duration::days(3);
        let msg = mbox
            .create(NewItem::message(system::INBOX, "old").received_at(old))
            .unwrap();
        let contact = mbox
            .create(NewItem::new(ItemKind::Contact, system::CONTACTS).received_at(old))
            .unwrap();

        let scope = ScopeFilter::unscoped(Some(Utc::now().timestamp()));
        assert!(!scope.admit(&mbox, &msg).unwrap());
        assert!(scope.admit(&mbox, &contact).unwrap());

        let all = ScopeFilter::unscoped(Some(0));
        assert!(all.admit(&mbox, &msg).unwrap());
    }

    #[test]
    fn test_tombstone_judged_at_cursor() {
        let mbox = InMemoryMailbox::new();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();
        let moved = mbox.move_item(msg.id, system::SENT).unwrap();
        let tombstone = mbox.delete(msg.id).unwrap().remove(0);

        let mut inbox = ScopeFilter::build(&mbox, Some(system::INBOX), None).unwrap();
        assert!(inbox.tombstone_visible(&mbox, &tombstone, msg.change_id).unwrap());
        assert!(!inbox.tombstone_visible(&mbox, &tombstone, moved.change_id).unwrap());
        // not yet created at the cursor
        assert!(!inbox.tombstone_visible(&mbox, &tombstone, 0).unwrap());
        assert!(!inbox
            .tombstone_ends_in_scope(&mbox, &tombstone, msg.change_id)
            .unwrap());
    }

    #[test]
    fn test_deleted_subfolder_still_resolves() {
        let mbox = InMemoryMailbox::new();
        let work = mbox.create(NewItem::folder(system::ROOT, "Work")).unwrap();
        let sub = mbox.create(NewItem::folder(work.id, "Sub")).unwrap();
        let msg = mbox.create(NewItem::message(sub.id, "m")).unwrap();
        let at = msg.change_id;
        let tombstones = mbox.delete(sub.id).unwrap();

        let mut scope = ScopeFilter::build(&mbox, Some(work.id), None).unwrap();
        for tombstone in &tombstones {
            assert!(scope.tombstone_visible(&mbox, tombstone, at).unwrap());
        }
    }

    #[test]
    fn test_was_visible_after_move_out() {
        let mbox = InMemoryMailbox::new();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();
        let moved = mbox.move_item(msg.id, system::TRASH).unwrap();

        let mut scope = ScopeFilter::build(&mbox, Some(system::INBOX), None).unwrap();
        assert!(!scope.admit(&mbox, &moved).unwrap());
        assert!(scope.was_visible(&mbox, &moved, msg.change_id).unwrap());
        assert!(!scope.was_visible(&mbox, &moved, 0).unwrap());

        let mut unscoped = ScopeFilter::unscoped(None);
        assert!(!unscoped.was_visible(&mbox, &moved, msg.change_id).unwrap());
    }

    #[test]
    fn test_was_visible_ignores_cutoff() {
        let mbox = InMemoryMailbox::new();
        let old = Utc::now() - Duration::days(3);
        let msg = mbox
            .create(NewItem::message(system::INBOX, "old").received_at(old))
            .unwrap();
        let moved = mbox.move_item(msg.id, system::TRASH).unwrap();

        let mut scope =
            ScopeFilter::build(&mbox, Some(system::INBOX), Some(Utc::now().timestamp())).unwrap();
        assert!(!scope.passes_cutoff(&moved));
        assert!(scope.was_visible(&mbox, &moved, msg.change_id).unwrap());
    }
}
