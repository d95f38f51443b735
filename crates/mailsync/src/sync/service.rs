//! Sync orchestrator: entry point for one sync request

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::planner::{PageLimits, plan};
use super::scope::ScopeFilter;
use super::snapshot::{SnapshotFolder, snapshot};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{DeletedItem, FolderId, ItemId, ItemKind, ItemSummary, SyncToken};
use crate::storage::MailboxLogReader;

/// A client's sync request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Token from the previous response; absent on first sync
    #[serde(default)]
    pub token: Option<String>,
    /// Restrict the sync to this folder's subtree
    #[serde(default)]
    pub folder: Option<FolderId>,
    /// Most items (and synthetic deletions) per page, capped by the server
    /// maximum. Absent means the server maximum. Zero pauses the change
    /// stream for this page while deletions continue; zero for both limits
    /// is served as if neither were given.
    #[serde(default)]
    pub change_limit: Option<usize>,
    /// Most tombstones per page, capped by the server maximum. Absent and
    /// zero behave as for `change_limit`.
    #[serde(default)]
    pub delete_limit: Option<usize>,
    /// Only messages received at or after this time (epoch seconds)
    #[serde(default)]
    pub cutoff: Option<i64>,
    /// Group deletions by kind in the response
    #[serde(default)]
    pub typed_deletes: bool,
}

impl SyncRequest {
    /// First sync: asks for a snapshot
    pub fn initial() -> Self {
        Self::default()
    }

    /// Resume from a token
    pub fn resume(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn folder(mut self, folder: FolderId) -> Self {
        self.folder = Some(folder);
        self
    }

    pub fn limits(mut self, change_limit: usize, delete_limit: usize) -> Self {
        self.change_limit = Some(change_limit);
        self.delete_limit = Some(delete_limit);
        self
    }

    pub fn cutoff(mut self, cutoff: i64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn typed_deletes(mut self) -> Self {
        self.typed_deletes = true;
        self
    }
}

/// Response to a sync request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub token: SyncToken,
    /// Server time of the response, epoch seconds
    pub change_date: i64,
    pub items: Vec<ItemSummary>,
    pub deleted: Vec<DeletedItem>,
    /// Deletions grouped by kind, when the request asked for typed deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typed_deleted: Option<BTreeMap<ItemKind, Vec<ItemId>>>,
    /// `Some(true)` while further pages remain; absent once caught up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    /// Folder tree of a snapshot response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders: Option<SnapshotFolder>,
}

impl SyncResponse {
    pub fn has_more(&self) -> bool {
        self.more.unwrap_or(false)
    }

    pub fn is_snapshot(&self) -> bool {
        self.folders.is_some()
    }

    /// Deleted ids grouped by kind
    pub fn deleted_by_kind(&self) -> BTreeMap<ItemKind, Vec<ItemId>> {
        let mut grouped: BTreeMap<ItemKind, Vec<ItemId>> = BTreeMap::new();
        for gone in &self.deleted {
            grouped.entry(gone.kind).or_default().push(gone.id);
        }
        grouped
    }
}

/// Serves sync requests for one mailbox
#[derive(Clone)]
pub struct SyncService {
    reader: Arc<dyn MailboxLogReader>,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(reader: Arc<dyn MailboxLogReader>, config: SyncConfig) -> Self {
        Self { reader, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync request
    pub fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let result = self.run(request);
        if let Err(e) = &result {
            match e {
                SyncError::InvalidToken { .. } | SyncError::UnknownScope { .. } => {
                    warn!("Rejected sync request: {}", e)
                }
                SyncError::StorageUnavailable(_) => warn!("Sync request failed: {:#}", e),
                SyncError::Invariant(_) => error!("Sync request failed: {}", e),
            }
        }
        result
    }

    fn run(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let token = request
            .token
            .as_deref()
            .map(SyncToken::decode)
            .transpose()?;
        let mut scope = ScopeFilter::build(self.reader.as_ref(), request.folder, request.cutoff)?;

        let mut response = match token {
            None => self.snapshot(&scope)?,
            Some(token) => self.delta(token, request, &mut scope)?,
        };
        if request.typed_deletes {
            response.typed_deleted = Some(response.deleted_by_kind());
        }
        Ok(response)
    }

    fn snapshot(&self, scope: &ScopeFilter) -> Result<SyncResponse, SyncError> {
        let mark = self.reader.high_water_mark()?;
        let tree = snapshot(
            self.reader.as_ref(),
            scope,
            self.config.snapshot_stub_depth,
        )?;

        info!(
            "Snapshot of folder {} at {}: {} folders, {} items",
            tree.folder.id,
            mark,
            tree.folder_count(),
            tree.item_count()
        );

        Ok(SyncResponse {
            token: mark,
            change_date: Utc::now().timestamp(),
            items: Vec::new(),
            deleted: Vec::new(),
            typed_deleted: None,
            more: None,
            folders: Some(tree),
        })
    }

    fn delta(
        &self,
        token: SyncToken,
        request: &SyncRequest,
        scope: &mut ScopeFilter,
    ) -> Result<SyncResponse, SyncError> {
        let limits = self.resolve_limits(request);
        debug!(
            "Delta sync from {} (changes {}, deletes {})",
            token, limits.changes, limits.deletes
        );

        let page = plan(self.reader.as_ref(), token, limits, scope)?;

        Ok(SyncResponse {
            token: page.new_token,
            change_date: Utc::now().timestamp(),
            items: page.items,
            deleted: page.deleted,
            typed_deleted: None,
            more: page.more.then_some(true),
            folders: None,
        })
    }

    /// Clamp requested limits to the server maximums
    ///
    /// An absent limit means the maximum; zero pauses a stream, but a request
    /// pausing both streams is served as if it named no limits.
    fn resolve_limits(&self, request: &SyncRequest) -> PageLimits {
        let (change_limit, delete_limit) = match (request.change_limit, request.delete_limit) {
            (Some(0), Some(0)) => (None, None),
            limits => limits,
        };
        PageLimits {
            changes: clamp(change_limit, self.config.max_change_count),
            deletes: clamp(delete_limit, self.config.max_delete_count),
            batch_size: self.config.fetch_batch_size,
        }
    }
}

fn clamp(requested: Option<usize>, max: usize) -> usize {
    requested.map_or(max, |n| n.min(max))
}
