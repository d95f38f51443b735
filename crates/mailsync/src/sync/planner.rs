//! Page planner: one bounded delta page from a sync token

use log::debug;

use super::log::{ScanWindow, changes_since, dedupe_deleted, deletes_since};
use super::scope::ScopeFilter;
use crate::error::SyncError;
use crate::models::{SyncPage, SyncToken};
use crate::storage::MailboxLogReader;

/// Per-stream page limits; zero pauses a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub changes: usize,
    pub deletes: usize,
    /// Records fetched per storage round trip
    pub batch_size: usize,
}

/// Plan the page that follows `token`
///
/// The tombstone log is scanned first so the change scan knows which
/// deletions this page already carries. Both scans judge moved and deleted
/// items against `token.last_change_id`, the last state the client saw.
pub fn plan(
    reader: &dyn MailboxLogReader,
    token: SyncToken,
    limits: PageLimits,
    scope: &mut ScopeFilter,
) -> Result<SyncPage, SyncError> {
    let mark = reader.high_water_mark()?;
    if token.is_ahead_of(&mark) {
        return Err(SyncError::InvalidToken {
            token: token.encode(),
            reason: format!("ahead of the mailbox high-water mark {}", mark),
        });
    }
    if token == mark {
        return Ok(SyncPage::empty(token));
    }

    let seen_through = token.last_change_id;
    let deletes = deletes_since(
        reader,
        scope,
        token.last_delete_seq,
        mark.last_delete_seq,
        ScanWindow {
            seen_through,
            limit: limits.deletes,
            batch_size: limits.batch_size,
        },
    )?;
    let changes = changes_since(
        reader,
        scope,
        token.last_change_id,
        mark.last_change_id,
        deletes.next_delete_seq,
        ScanWindow {
            seen_through,
            limit: limits.changes,
            batch_size: limits.batch_size,
        },
    )?;

    let new_token = SyncToken::new(changes.next_change_id, deletes.next_delete_seq);
    if !new_token.covers(&token) {
        return Err(SyncError::Invariant(format!(
            "cursor moved backwards from {} to {}",
            token, new_token
        )));
    }

    let page = SyncPage {
        items: changes.items,
        deleted: dedupe_deleted(deletes.deleted.into_iter().chain(changes.deleted)),
        new_token,
        more: changes.has_more || deletes.has_more,
    };

    debug!(
        "Planned page {} -> {} (mark {}): {} items, {} deleted, more={}",
        token,
        page.new_token,
        mark,
        page.items.len(),
        page.deleted.len(),
        page.more
    );

    Ok(page)
}
