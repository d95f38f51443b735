//! Bounded scans of the change log and the tombstone log
//!
//! Each scan reads records in ascending order, in batches, up to the
//! high-water mark sampled for the request. A scan stops as soon as it finds
//! one admissible record more than its limit allows, leaving its cursor on
//! the last record it consumed; a scan that runs out of records moves its
//! cursor to the high-water mark. A limit of zero pauses the stream at its
//! first admissible record and only reports that something is pending.
//!
//! The change scan never passes the record of a deleted item whose tombstone
//! is still ahead of the delete cursor and invisible at the client's change
//! cursor. Passing it would make the tombstone look visible once the change
//! cursor moved, reporting a deletion of an item the client never held.

use std::collections::HashSet;

use log::error;

use super::scope::ScopeFilter;
use crate::error::SyncError;
use crate::models::{
    ChangeId, ChangeRecord, DeleteSeq, DeletedItem, ItemKind, ItemSummary, Tombstone,
};
use crate::storage::MailboxLogReader;

/// Result of scanning the change log
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSlice {
    pub items: Vec<ItemSummary>,
    /// Items that left the scope without being deleted
    pub deleted: Vec<DeletedItem>,
    pub next_change_id: ChangeId,
    pub has_more: bool,
}

/// Result of scanning the tombstone log
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteSlice {
    pub deleted: Vec<DeletedItem>,
    pub next_delete_seq: DeleteSeq,
    pub has_more: bool,
}

/// Bounds of one scan
#[derive(Debug, Clone, Copy)]
pub struct ScanWindow {
    /// Client's change cursor; scope of deleted or moved items is judged here
    pub seen_through: ChangeId,
    /// Page limit; zero pauses the stream
    pub limit: usize,
    /// Records fetched per storage round trip
    pub batch_size: usize,
}

/// What one change record contributes to a page
enum ChangeOutcome {
    Upsert(ItemSummary),
    Drop(DeletedItem),
    Skip,
    /// Stop before this record until the delete stream has judged its tombstone
    Hold,
}

/// Scan the tombstone log past `since`, up to `upto`
pub fn deletes_since(
    reader: &dyn MailboxLogReader,
    scope: &mut ScopeFilter,
    since: DeleteSeq,
    upto: DeleteSeq,
    window: ScanWindow,
) -> Result<DeleteSlice, SyncError> {
    let mut deleted: Vec<DeletedItem> = Vec::new();
    let mut cursor = since;

    loop {
        let batch = reader.tombstones_after(cursor, upto, window.batch_size.max(1))?;
        if batch.is_empty() {
            return Ok(DeleteSlice {
                deleted,
                next_delete_seq: upto.max(since),
                has_more: false,
            });
        }

        for tombstone in batch {
            check_ascending(cursor, tombstone.delete_seq, "delete sequence")?;
            if !scope.tombstone_visible(reader, &tombstone, window.seen_through)? {
                cursor = tombstone.delete_seq;
                continue;
            }
            if deleted.len() == window.limit {
                return Ok(DeleteSlice {
                    deleted,
                    next_delete_seq: cursor,
                    has_more: true,
                });
            }
            deleted.push(DeletedItem::new(tombstone.item_id, tombstone.kind));
            cursor = tombstone.delete_seq;
        }
    }
}

/// Scan the change log past `since`, up to `upto`
///
/// `deletes_through` is the delete cursor the page will hand out; deleted
/// items whose tombstone lies at or below it are already accounted for.
pub fn changes_since(
    reader: &dyn MailboxLogReader,
    scope: &mut ScopeFilter,
    since: ChangeId,
    upto: ChangeId,
    deletes_through: DeleteSeq,
    window: ScanWindow,
) -> Result<ChangeSlice, SyncError> {
    let mut items = Vec::new();
    let mut deleted = Vec::new();
    let mut cursor = since;

    loop {
        let batch = reader.changes_after(cursor, upto, window.batch_size.max(1))?;
        if batch.is_empty() {
            return Ok(ChangeSlice {
                items,
                deleted,
                next_change_id: upto.max(since),
                has_more: false,
            });
        }

        for record in batch {
            check_ascending(cursor, record.change_id, "change id")?;
            let outcome = classify(reader, scope, &record, deletes_through, window.seen_through)?;
            if matches!(outcome, ChangeOutcome::Skip) {
                cursor = record.change_id;
                continue;
            }
            if matches!(outcome, ChangeOutcome::Hold)
                || items.len() + deleted.len() == window.limit
            {
                return Ok(ChangeSlice {
                    items,
                    deleted,
                    next_change_id: cursor,
                    has_more: true,
                });
            }
            match outcome {
                ChangeOutcome::Upsert(summary) => items.push(summary),
                ChangeOutcome::Drop(gone) => deleted.push(gone),
                ChangeOutcome::Skip | ChangeOutcome::Hold => {}
            }
            cursor = record.change_id;
        }
    }
}

fn classify(
    reader: &dyn MailboxLogReader,
    scope: &mut ScopeFilter,
    record: &ChangeRecord,
    deletes_through: DeleteSeq,
    seen_through: ChangeId,
) -> Result<ChangeOutcome, SyncError> {
    if let Some(item) = reader.get_item(record.item_id)? {
        // mutated again after the high-water mark; the newer record is
        // picked up by a later page
        if item.change_id != record.change_id {
            return Ok(ChangeOutcome::Skip);
        }
        if scope.admit(reader, &item)? {
            return Ok(ChangeOutcome::Upsert(ItemSummary::from_item(&item, seen_through)));
        }
        if scope.was_visible(reader, &item, seen_through)? {
            return Ok(ChangeOutcome::Drop(DeletedItem::new(item.id, item.kind)));
        }
        return Ok(ChangeOutcome::Skip);
    }

    let Some(tombstone) = reader.get_tombstone(record.item_id)? else {
        error!(
            "Change record {} names item {} with neither state nor tombstone",
            record.change_id, record.item_id
        );
        return Err(SyncError::Invariant(format!(
            "item {} at change {} has no state and no tombstone",
            record.item_id, record.change_id
        )));
    };

    if tombstone.delete_seq <= deletes_through {
        return Ok(ChangeOutcome::Skip);
    }
    if !scope.tombstone_visible(reader, &tombstone, seen_through)? {
        return Ok(ChangeOutcome::Hold);
    }
    if moved_out_before_delete(reader, scope, &tombstone, seen_through)? {
        return Ok(ChangeOutcome::Drop(DeletedItem::new(tombstone.item_id, tombstone.kind)));
    }
    Ok(ChangeOutcome::Skip)
}

/// Whether the item, visible to a client at `seen_through`, was deleted
/// outside the scope, so its tombstone will never reach that client
fn moved_out_before_delete(
    reader: &dyn MailboxLogReader,
    scope: &mut ScopeFilter,
    tombstone: &Tombstone,
    seen_through: ChangeId,
) -> Result<bool, SyncError> {
    if scope.root().is_none() || matches!(tombstone.kind, ItemKind::Conversation | ItemKind::Tag) {
        return Ok(false);
    }
    Ok(!scope.tombstone_ends_in_scope(reader, tombstone, seen_through)?)
}

fn check_ascending(cursor: i64, next: i64, what: &str) -> Result<(), SyncError> {
    if next <= cursor {
        error!("Log returned {} {} at or below cursor {}", what, next, cursor);
        return Err(SyncError::Invariant(format!(
            "{} {} is not past cursor {}",
            what, next, cursor
        )));
    }
    Ok(())
}

/// Merge deletions from both streams, keeping the first of each id
pub fn dedupe_deleted(deleted: impl IntoIterator<Item = DeletedItem>) -> Vec<DeletedItem> {
    let mut seen = HashSet::new();
    deleted
        .into_iter()
        .filter(|gone| seen.insert(gone.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemId, NO_DELETES, system};
    use crate::storage::{InMemoryMailbox, MailboxWriter, NewItem};

    fn window(seen_through: ChangeId, limit: usize) -> ScanWindow {
        ScanWindow {
            seen_through,
            limit,
            batch_size: 2,
        }
    }

    fn mailbox_with_messages(n: usize) -> InMemoryMailbox {
        let mbox = InMemoryMailbox::new();
        for i in 0..n {
            mbox.create(NewItem::message(system::INBOX, format!("m{}", i)))
                .unwrap();
        }
        mbox
    }

    #[test]
    fn test_changes_limit_cuts_page() {
        let mbox = mailbox_with_messages(5);
        let mut scope = ScopeFilter::unscoped(None);

        let slice = changes_since(&mbox, &mut scope, 0, 5, NO_DELETES, window(0, 3)).unwrap();
        assert_eq!(slice.items.len(), 3);
        assert_eq!(slice.next_change_id, 3);
        assert!(slice.has_more);
        assert!(slice.items.iter().all(|i| i.created));

        let rest = changes_since(&mbox, &mut scope, 3, 5, NO_DELETES, window(3, 3)).unwrap();
        assert_eq!(rest.items.len(), 2);
        assert_eq!(rest.next_change_id, 5);
        assert!(!rest.has_more);
    }

    #[test]
    fn test_exact_limit_reports_no_more() {
        let mbox = mailbox_with_messages(4);
        let mut scope = ScopeFilter::unscoped(None);

        let slice = changes_since(&mbox, &mut scope, 0, 4, NO_DELETES, window(0, 4)).unwrap();
        assert_eq!(slice.items.len(), 4);
        assert!(!slice.has_more);
        assert_eq!(slice.next_change_id, 4);
    }

    #[test]
    fn test_filtered_tail_jumps_to_high_water_mark() {
        let mbox = InMemoryMailbox::new();
        mbox.create(NewItem::message(system::INBOX, "in")).unwrap();
        mbox.create(NewItem::message(system::SENT, "out")).unwrap();
        mbox.create(NewItem::message(system::SENT, "out")).unwrap();

        let mut scope = ScopeFilter::build(&mbox, Some(system::INBOX), None).unwrap();
        let slice = changes_since(&mbox, &mut scope, 0, 3, NO_DELETES, window(0, 1)).unwrap();
        assert_eq!(slice.items.len(), 1);
        assert_eq!(slice.next_change_id, 3);
        assert!(!slice.has_more);
    }

    #[test]
    fn test_zero_limit_pauses() {
        let mbox = mailbox_with_messages(3);
        let mut scope = ScopeFilter::unscoped(None);

        let slice = changes_since(&mbox, &mut scope, 0, 3, NO_DELETES, window(0, 0)).unwrap();
        assert!(slice.items.is_empty());
        assert_eq!(slice.next_change_id, 0);
        assert!(slice.has_more);

        let caught_up = changes_since(&mbox, &mut scope, 3, 3, NO_DELETES, window(3, 0)).unwrap();
        assert!(!caught_up.has_more);
        assert_eq!(caught_up.next_change_id, 3);
    }

    #[test]
    fn test_deletes_since_respects_limit() {
        let mbox = mailbox_with_messages(4);
        for id in 256..259 {
            mbox.delete(ItemId(id)).unwrap();
        }
        let mut scope = ScopeFilter::unscoped(None);

        let first = deletes_since(&mbox, &mut scope, NO_DELETES, 2, window(4, 2)).unwrap();
        assert_eq!(first.deleted.len(), 2);
        assert_eq!(first.next_delete_seq, 1);
        assert!(first.has_more);

        let second = deletes_since(&mbox, &mut scope, 1, 2, window(4, 2)).unwrap();
        assert_eq!(second.deleted, vec![DeletedItem::new(ItemId(258), ItemKind::Message)]);
        assert_eq!(second.next_delete_seq, 2);
        assert!(!second.has_more);
    }

    #[test]
    fn test_unseen_deletes_are_suppressed() {
        let mbox = mailbox_with_messages(2);
        mbox.delete(ItemId(257)).unwrap();
        let mut scope = ScopeFilter::unscoped(None);

        // the client stopped before item 257 was created
        let slice = deletes_since(&mbox, &mut scope, NO_DELETES, 0, window(1, 10)).unwrap();
        assert!(slice.deleted.is_empty());
        assert_eq!(slice.next_delete_seq, 0);
    }

    #[test]
    fn test_deleted_item_with_passed_tombstone_is_skipped() {
        let mbox = mailbox_with_messages(2);
        mbox.delete(ItemId(256)).unwrap();
        let mut scope = ScopeFilter::unscoped(None);

        let slice = changes_since(&mbox, &mut scope, 0, 2, 0, window(0, 10)).unwrap();
        assert_eq!(slice.items.len(), 1);
        assert!(slice.deleted.is_empty());
        assert_eq!(slice.next_change_id, 2);
    }

    #[test]
    fn test_change_scan_holds_before_unjudged_tombstone() {
        let mbox = InMemoryMailbox::new();
        mbox.create(NewItem::message(system::INBOX, "seen")).unwrap();
        let fresh = mbox.create(NewItem::message(system::INBOX, "fresh")).unwrap();
        mbox.delete(fresh.id).unwrap();
        mbox.create(NewItem::message(system::INBOX, "later")).unwrap();
        let mut scope = ScopeFilter::unscoped(None);

        let held = changes_since(&mbox, &mut scope, 1, 3, NO_DELETES, window(1, 10)).unwrap();
        assert!(held.items.is_empty());
        assert!(held.deleted.is_empty());
        assert_eq!(held.next_change_id, 1);
        assert!(held.has_more);

        // once the tombstone is behind the delete cursor the record is skipped
        let slice = changes_since(&mbox, &mut scope, 1, 3, 0, window(1, 10)).unwrap();
        assert_eq!(slice.items.len(), 1);
        assert_eq!(slice.next_change_id, 3);
        assert!(!slice.has_more);
    }

    #[test]
    fn test_paused_deletes_consume_unseen_tombstones() {
        let mbox = InMemoryMailbox::new();
        let seen = mbox.create(NewItem::message(system::INBOX, "seen")).unwrap();
        let fresh = mbox.create(NewItem::message(system::INBOX, "fresh")).unwrap();
        mbox.delete(fresh.id).unwrap();
        mbox.delete(seen.id).unwrap();
        let mut scope = ScopeFilter::unscoped(None);

        let slice = deletes_since(&mbox, &mut scope, NO_DELETES, 1, window(1, 0)).unwrap();
        assert!(slice.deleted.is_empty());
        assert_eq!(slice.next_delete_seq, 0);
        assert!(slice.has_more);
    }

    #[test]
    fn test_move_out_of_scope_becomes_delete() {
        let mbox = InMemoryMailbox::new();
        let msg = mbox.create(NewItem::message(system::INBOX, "m")).unwrap();
        mbox.move_item(msg.id, system::TRASH).unwrap();

        let mut scope = ScopeFilter::build(&mbox, Some(system::INBOX), None).unwrap();
        let slice = changes_since(&mbox, &mut scope, 1, 2, NO_DELETES, window(1, 10)).unwrap();
        assert!(slice.items.is_empty());
        assert_eq!(slice.deleted, vec![DeletedItem::new(msg.id, ItemKind::Message)]);
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let a = DeletedItem::new(ItemId(300), ItemKind::Message);
        let b = DeletedItem::new(ItemId(301), ItemKind::Folder);
        assert_eq!(dedupe_deleted([a, b, a]), vec![a, b]);
    }
}
