//! In-memory mailbox log
//!
//! Used by tests and as the reference implementation of the log semantics.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{MailboxLogReader, MailboxWriter, NewItem};
use crate::models::{
    ChangeId, ChangeRecord, DeleteSeq, FolderId, ItemId, ItemKind, MailItem, NO_DELETES,
    Placement, SyncToken, Tombstone, system,
};

/// Everything a mailbox knows, guarded by one lock
struct MailboxState {
    /// Live items
    items: HashMap<ItemId, MailItem>,
    /// Latest change record of every item ever written, live or deleted
    changes: BTreeMap<ChangeId, ChangeRecord>,
    tombstones: BTreeMap<DeleteSeq, Tombstone>,
    tombstone_index: HashMap<ItemId, DeleteSeq>,
    placements: HashMap<ItemId, Vec<Placement>>,
    /// Folder -> live items held directly, folders included
    contents: HashMap<FolderId, BTreeSet<ItemId>>,
    /// Conversation -> live member messages
    members: HashMap<ItemId, BTreeSet<ItemId>>,
    last_change_id: ChangeId,
    last_delete_seq: DeleteSeq,
    next_item_id: i64,
}

impl MailboxState {
    fn bootstrap(now: DateTime<Utc>) -> Self {
        let mut state = Self {
            items: HashMap::new(),
            changes: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            tombstone_index: HashMap::new(),
            placements: HashMap::new(),
            contents: HashMap::new(),
            members: HashMap::new(),
            last_change_id: 0,
            last_delete_seq: NO_DELETES,
            next_item_id: system::FIRST_USER_ID,
        };

        let root = MailItem::root_folder(now);
        state.placements.insert(root.id, vec![Placement::new(0, root.id)]);
        state.items.insert(root.id, root);
        for (id, name) in system::FOLDERS {
            let folder = MailItem::system_folder(id, name, now);
            state.placements.insert(id, vec![Placement::new(0, system::ROOT)]);
            state.contents.entry(system::ROOT).or_default().insert(id);
            state.items.insert(id, folder);
        }
        state
    }

    fn live(&self, id: ItemId) -> Result<&MailItem> {
        self.items
            .get(&id)
            .with_context(|| format!("No such item: {}", id))
    }

    fn container(&self, id: FolderId) -> Result<&MailItem> {
        let folder = self.live(id)?;
        if !folder.kind.is_container() {
            bail!("Item {} is a {}, not a folder", id, folder.kind);
        }
        Ok(folder)
    }

    fn next_change(&mut self) -> Result<ChangeId> {
        self.last_change_id = self
            .last_change_id
            .checked_add(1)
            .ok_or_else(|| anyhow!("Change id overflow"))?;
        Ok(self.last_change_id)
    }

    fn next_delete_seq(&mut self) -> Result<DeleteSeq> {
        self.last_delete_seq = self
            .last_delete_seq
            .checked_add(1)
            .ok_or_else(|| anyhow!("Delete sequence overflow"))?;
        Ok(self.last_delete_seq)
    }

    fn next_id(&mut self) -> Result<ItemId> {
        let id = ItemId(self.next_item_id);
        self.next_item_id = self
            .next_item_id
            .checked_add(1)
            .ok_or_else(|| anyhow!("Item id overflow"))?;
        Ok(id)
    }

    /// Replace the change record of `id`, which previously sat at `old`
    fn record(&mut self, id: ItemId, kind: ItemKind, old: ChangeId, new: ChangeId) {
        if self.changes.get(&old).is_some_and(|r| r.item_id == id) {
            self.changes.remove(&old);
        }
        self.changes.insert(
            new,
            ChangeRecord {
                item_id: id,
                kind,
                change_id: new,
            },
        );
    }

    /// Give a live item a fresh change id
    fn bump(&mut self, id: ItemId) -> Result<MailItem> {
        let change = self.next_change()?;
        let item = self
            .items
            .get_mut(&id)
            .with_context(|| format!("No such item: {}", id))?;
        let old = item.change_id;
        item.change_id = change;
        let item = item.clone();
        self.record(id, item.kind, old, change);
        Ok(item)
    }

    /// Depth-first list of everything removed along with `id`, `id` last
    fn collect_doomed(&self, id: ItemId, doomed: &mut Vec<ItemId>) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        match item.kind {
            ItemKind::Folder => {
                if let Some(children) = self.contents.get(&id) {
                    for child in children {
                        self.collect_doomed(*child, doomed);
                    }
                }
            }
            ItemKind::Conversation => {
                if let Some(members) = self.members.get(&id) {
                    doomed.extend(members.iter().copied());
                }
            }
            _ => {}
        }
        doomed.push(id);
    }

    /// Remove a live item and write its tombstone
    fn bury(
        &mut self,
        id: ItemId,
        extra_member_folders: &BTreeSet<FolderId>,
        now: DateTime<Utc>,
    ) -> Result<Tombstone> {
        let delete_seq = self.next_delete_seq()?;
        let item = self
            .items
            .remove(&id)
            .with_context(|| format!("No such item: {}", id))?;

        if let Some(siblings) = self.contents.get_mut(&item.folder_id) {
            siblings.remove(&id);
        }
        self.contents.remove(&id);

        let mut member_folders: BTreeSet<FolderId> = extra_member_folders.clone();
        if let Some(members) = self.members.remove(&id) {
            member_folders.extend(
                members
                    .iter()
                    .filter_map(|m| self.items.get(m))
                    .map(|m| m.folder_id),
            );
        }
        if let Some(conversation) = item.conversation_id
            && let Some(members) = self.members.get_mut(&conversation)
        {
            members.remove(&id);
        }

        let tombstone = Tombstone {
            item_id: id,
            kind: item.kind,
            delete_seq,
            created_change: item.created_change,
            placements: self.placements.get(&id).cloned().unwrap_or_default(),
            member_folders: member_folders.into_iter().collect(),
            deleted_at: now,
        };
        self.tombstones.insert(delete_seq, tombstone.clone());
        self.tombstone_index.insert(id, delete_seq);
        Ok(tombstone)
    }

    /// Whether `folder` is `ancestor` or lies below it
    fn is_within(&self, folder: FolderId, ancestor: FolderId) -> bool {
        let mut current = folder;
        loop {
            if current == ancestor {
                return true;
            }
            match self.items.get(&current) {
                Some(item) if !item.is_root() => current = item.folder_id,
                _ => return false,
            }
        }
    }
}

/// In-memory implementation of the mailbox log
///
/// The `RwLock` write guard is the mailbox's single write lock; readers
/// take the read guard only for the duration of one query.
pub struct InMemoryMailbox {
    state: RwLock<MailboxState>,
}

impl InMemoryMailbox {
    /// Create a mailbox holding only the system folders
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MailboxState::bootstrap(Utc::now())),
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, MailboxState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("Mailbox state lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, MailboxState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("Mailbox state lock poisoned"))
    }

    /// Number of live items, system folders included
    pub fn item_count(&self) -> Result<usize> {
        Ok(self.read_state()?.items.len())
    }
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxLogReader for InMemoryMailbox {
    fn high_water_mark(&self) -> Result<SyncToken> {
        let state = self.read_state()?;
        Ok(SyncToken::new(state.last_change_id, state.last_delete_seq))
    }

    fn changes_after(
        &self,
        after: ChangeId,
        upto: ChangeId,
        max: usize,
    ) -> Result<Vec<ChangeRecord>> {
        if upto <= after {
            return Ok(Vec::new());
        }
        let state = self.read_state()?;
        Ok(state
            .changes
            .range(after + 1..=upto)
            .take(max)
            .map(|(_, record)| *record)
            .collect())
    }

    fn tombstones_after(
        &self,
        after: DeleteSeq,
        upto: DeleteSeq,
        max: usize,
    ) -> Result<Vec<Tombstone>> {
        if upto <= after {
            return Ok(Vec::new());
        }
        let state = self.read_state()?;
        Ok(state
            .tombstones
            .range(after + 1..=upto)
            .take(max)
            .map(|(_, tombstone)| tombstone.clone())
            .collect())
    }

    fn get_item(&self, id: ItemId) -> Result<Option<MailItem>> {
        Ok(self.read_state()?.items.get(&id).cloned())
    }

    fn get_tombstone(&self, id: ItemId) -> Result<Option<Tombstone>> {
        let state = self.read_state()?;
        Ok(state
            .tombstone_index
            .get(&id)
            .and_then(|seq| state.tombstones.get(seq))
            .cloned())
    }

    fn placements(&self, id: ItemId) -> Result<Vec<Placement>> {
        Ok(self
            .read_state()?
            .placements
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    fn conversation_members(&self, conversation: ItemId) -> Result<Vec<MailItem>> {
        let state = self.read_state()?;
        Ok(state
            .members
            .get(&conversation)
            .map(|ids| ids.iter().filter_map(|id| state.items.get(id)).cloned().collect())
            .unwrap_or_default())
    }

    fn list_folders(&self) -> Result<Vec<MailItem>> {
        let state = self.read_state()?;
        let mut folders: Vec<MailItem> = state
            .items
            .values()
            .filter(|item| item.kind.is_folder_like())
            .cloned()
            .collect();
        folders.sort_by_key(|f| f.id);
        Ok(folders)
    }

    fn items_in_folder(&self, folder: FolderId) -> Result<Vec<MailItem>> {
        let state = self.read_state()?;
        Ok(state
            .contents
            .get(&folder)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.items.get(id))
                    .filter(|item| !item.kind.is_folder_like())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl MailboxWriter for InMemoryMailbox {
    fn create(&self, new: NewItem) -> Result<MailItem> {
        let mut state = self.write_state()?;

        match new.kind {
            ItemKind::Tag if new.folder_id != system::TAGS => {
                bail!("Tags must be created in the tags folder")
            }
            ItemKind::Conversation if new.folder_id != system::CONVERSATIONS => {
                bail!("Conversations must be created in the conversations folder")
            }
            ItemKind::Tag | ItemKind::Conversation => {}
            kind if matches!(new.folder_id, system::TAGS | system::CONVERSATIONS) => {
                bail!("Folder {} cannot hold a {}", new.folder_id, kind)
            }
            _ => {}
        }
        state.container(new.folder_id)?;
        if let Some(conversation) = new.conversation_id {
            if new.kind != ItemKind::Message {
                bail!("Only messages can belong to a conversation");
            }
            let conv = state.live(conversation)?;
            if conv.kind != ItemKind::Conversation {
                bail!("Item {} is not a conversation", conversation);
            }
        }

        let id = state.next_id()?;
        let change = state.next_change()?;
        let item = MailItem {
            id,
            kind: new.kind,
            folder_id: new.folder_id,
            conversation_id: new.conversation_id,
            change_id: change,
            created_change: change,
            created_at: new.created_at,
            name: new.name,
            subject: new.subject,
        };

        state.items.insert(id, item.clone());
        state.contents.entry(item.folder_id).or_default().insert(id);
        state
            .placements
            .insert(id, vec![Placement::new(change, item.folder_id)]);
        state.record(id, item.kind, change, change);
        if let Some(conversation) = item.conversation_id {
            state.members.entry(conversation).or_default().insert(id);
            state.bump(conversation)?;
        }

        Ok(item)
    }

    fn touch(&self, id: ItemId) -> Result<MailItem> {
        let mut state = self.write_state()?;
        state.live(id)?;
        state.bump(id)
    }

    fn move_item(&self, id: ItemId, folder: FolderId) -> Result<MailItem> {
        let mut state = self.write_state()?;

        let item = state.live(id)?.clone();
        if id.0 < system::FIRST_USER_ID {
            bail!("System folder {} cannot be moved", id);
        }
        if matches!(item.kind, ItemKind::Tag | ItemKind::Conversation) {
            bail!("A {} cannot be moved between folders", item.kind);
        }
        state.container(folder)?;
        if matches!(folder, system::TAGS | system::CONVERSATIONS) {
            bail!("Folder {} cannot hold a {}", folder, item.kind);
        }
        if item.kind.is_folder_like() && state.is_within(folder, id) {
            bail!("Cannot move folder {} into its own subtree", id);
        }
        if item.folder_id == folder {
            return Ok(item);
        }

        if let Some(siblings) = state.contents.get_mut(&item.folder_id) {
            siblings.remove(&id);
        }
        state.contents.entry(folder).or_default().insert(id);
        if let Some(current) = state.items.get_mut(&id) {
            current.folder_id = folder;
        }
        let moved = state.bump(id)?;
        state
            .placements
            .entry(id)
            .or_default()
            .push(Placement::new(moved.change_id, folder));
        if let Some(conversation) = moved.conversation_id {
            state.bump(conversation)?;
        }

        Ok(moved)
    }

    fn delete(&self, id: ItemId) -> Result<Vec<Tombstone>> {
        let mut state = self.write_state()?;
        let now = Utc::now();

        state.live(id)?;
        if id.0 < system::FIRST_USER_ID {
            bail!("System folder {} cannot be deleted", id);
        }

        let mut doomed = Vec::new();
        state.collect_doomed(id, &mut doomed);

        let mut tombstones = Vec::with_capacity(doomed.len());
        let mut vacated: BTreeMap<ItemId, BTreeSet<FolderId>> = BTreeMap::new();
        for victim in doomed {
            let (conversation, folder) = {
                let item = state.live(victim)?;
                (item.conversation_id, item.folder_id)
            };
            if let Some(conversation) = conversation {
                vacated.entry(conversation).or_default().insert(folder);
            }
            let extra = vacated.get(&victim).cloned().unwrap_or_default();
            tombstones.push(state.bury(victim, &extra, now)?);
        }

        // Conversations that lost messages: drop when empty, bump otherwise
        for (conversation, folders) in vacated {
            if !state.items.contains_key(&conversation) {
                continue;
            }
            let empty = state.members.get(&conversation).is_none_or(|m| m.is_empty());
            if empty {
                tombstones.push(state.bury(conversation, &folders, now)?);
            } else {
                state.bump(conversation)?;
            }
        }

        Ok(tombstones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> InMemoryMailbox {
        InMemoryMailbox::new()
    }

    #[test]
    fn test_bootstrap_high_water_mark() {
        let mbox = mailbox();
        assert_eq!(mbox.high_water_mark().unwrap(), SyncToken::initial());
        assert_eq!(mbox.item_count().unwrap(), 10);
        assert!(mbox.changes_after(0, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_each_item_gets_its_own_change_id() {
        let mbox = mailbox();
        let a = mbox.create(NewItem::message(system::INBOX, "a")).unwrap();
        let b = mbox.create(NewItem::message(system::INBOX, "b")).unwrap();
        assert_eq!(a.change_id, 1);
        assert_eq!(b.change_id, 2);

        let records = mbox.changes_after(0, 10, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].item_id, a.id);
    }

    #[test]
    fn test_changes_collapse_to_latest() {
        let mbox = mailbox();
        let a = mbox.create(NewItem::message(system::INBOX, "a")).unwrap();
        mbox.touch(a.id).unwrap();
        let touched = mbox.touch(a.id).unwrap();

        let records = mbox.changes_after(0, 10, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_id, touched.change_id);
    }

    #[test]
    fn test_changes_after_respects_bounds() {
        let mbox = mailbox();
        for i in 0..5 {
            mbox.create(NewItem::message(system::INBOX, format!("m{}", i)))
                .unwrap();
        }
        let ids: Vec<_> = mbox
            .changes_after(1, 4, 10)
            .unwrap()
            .iter()
            .map(|r| r.change_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(mbox.changes_after(1, 4, 2).unwrap().len(), 2);
        assert!(mbox.changes_after(4, 4, 10).unwrap().is_empty());
    }

    #[test]
    fn test_message_in_conversation_bumps_conversation() {
        let mbox = mailbox();
        let conv = mbox.create(NewItem::conversation("hello")).unwrap();
        let msg = mbox
            .create(NewItem::message(system::INBOX, "hello").in_conversation(conv.id))
            .unwrap();

        let conv_now = mbox.get_item(conv.id).unwrap().unwrap();
        assert!(conv_now.change_id > msg.change_id);
        assert_eq!(mbox.conversation_members(conv.id).unwrap().len(), 1);
    }

    #[test]
    fn test_move_records_placement() {
        let mbox = mailbox();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();
        let moved = mbox.move_item(msg.id, system::SENT).unwrap();

        let history = mbox.placements(msg.id).unwrap();
        assert_eq!(
            history,
            vec![
                Placement::new(msg.change_id, system::INBOX),
                Placement::new(moved.change_id, system::SENT)
            ]
        );
        assert!(mbox.items_in_folder(system::INBOX).unwrap().is_empty());
        assert_eq!(mbox.items_in_folder(system::SENT).unwrap().len(), 1);
    }

    #[test]
    fn test_move_rejects_cycles_and_system_folders() {
        let mbox = mailbox();
        let outer = mbox.create(NewItem::folder(system::ROOT, "outer")).unwrap();
        let inner = mbox.create(NewItem::folder(outer.id, "inner")).unwrap();

        assert!(mbox.move_item(outer.id, inner.id).is_err());
        assert!(mbox.move_item(outer.id, outer.id).is_err());
        assert!(mbox.move_item(system::INBOX, outer.id).is_err());
        assert!(mbox.move_item(inner.id, system::ROOT).is_ok());
    }

    #[test]
    fn test_delete_writes_tombstone_with_history() {
        let mbox = mailbox();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();
        mbox.move_item(msg.id, system::TRASH).unwrap();
        let tombstones = mbox.delete(msg.id).unwrap();

        assert_eq!(tombstones.len(), 1);
        let tombstone = &tombstones[0];
        assert_eq!(tombstone.delete_seq, 0);
        assert_eq!(tombstone.created_change, msg.change_id);
        assert_eq!(tombstone.final_folder(), Some(system::TRASH));
        assert_eq!(tombstone.folder_at(msg.change_id), Some(system::INBOX));

        assert!(mbox.get_item(msg.id).unwrap().is_none());
        assert_eq!(mbox.get_tombstone(msg.id).unwrap().unwrap(), *tombstone);
        assert_eq!(mbox.high_water_mark().unwrap().last_delete_seq, 0);
        // the last change record of a deleted item stays in the log
        assert_eq!(mbox.changes_after(0, 10, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_deleting_last_message_deletes_conversation() {
        let mbox = mailbox();
        let conv = mbox.create(NewItem::conversation("c")).unwrap();
        let a = mbox
            .create(NewItem::message(system::INBOX, "a").in_conversation(conv.id))
            .unwrap();
        let b = mbox
            .create(NewItem::message(system::SENT, "b").in_conversation(conv.id))
            .unwrap();

        let first = mbox.delete(a.id).unwrap();
        assert_eq!(first.len(), 1);
        assert!(mbox.get_item(conv.id).unwrap().is_some());

        let second = mbox.delete(b.id).unwrap();
        assert_eq!(second.len(), 2);
        let conv_tombstone = second.iter().find(|t| t.item_id == conv.id).unwrap();
        assert_eq!(conv_tombstone.member_folders, vec![system::SENT]);
    }

    #[test]
    fn test_deleting_conversation_deletes_messages() {
        let mbox = mailbox();
        let conv = mbox.create(NewItem::conversation("c")).unwrap();
        for subject in ["a", "b"] {
            mbox.create(NewItem::message(system::INBOX, subject).in_conversation(conv.id))
                .unwrap();
        }

        let tombstones = mbox.delete(conv.id).unwrap();
        assert_eq!(tombstones.len(), 3);
        assert_eq!(tombstones.last().unwrap().item_id, conv.id);
        assert_eq!(tombstones.last().unwrap().member_folders, vec![system::INBOX]);
        let seqs: Vec<_> = tombstones.iter().map(|t| t.delete_seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_deleting_folder_cascades() {
        let mbox = mailbox();
        let folder = mbox.create(NewItem::folder(system::ROOT, "f")).unwrap();
        let sub = mbox.create(NewItem::folder(folder.id, "sub")).unwrap();
        mbox.create(NewItem::message(sub.id, "deep")).unwrap();
        mbox.create(NewItem::message(folder.id, "shallow")).unwrap();

        let tombstones = mbox.delete(folder.id).unwrap();
        assert_eq!(tombstones.len(), 4);
        assert_eq!(tombstones.last().unwrap().item_id, folder.id);
        assert!(mbox.list_folders().unwrap().iter().all(|f| f.id != sub.id));
    }

    #[test]
    fn test_system_folders_are_protected() {
        let mbox = mailbox();
        assert!(mbox.delete(system::INBOX).is_err());
        assert!(mbox.create(NewItem::message(system::TAGS, "x")).is_err());
        assert!(mbox.create(NewItem::tag("urgent")).is_ok());
        assert!(mbox.create(NewItem::new(ItemKind::Tag, system::INBOX)).is_err());
        assert!(mbox.create(NewItem::message(ItemId(999), "x")).is_err());
    }
}
