//! Full-tree snapshot for clients that have no token yet

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::scope::ScopeFilter;
use crate::models::{ChangeId, FolderId, ItemId, ItemKind, ItemSummary, MailItem, system};
use crate::storage::MailboxLogReader;

/// Everything in a snapshot is new to the client
const NOTHING_SEEN: ChangeId = -1;

/// One folder of a snapshot and, unless stubbed, its visible contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFolder {
    pub folder: ItemSummary,
    /// Contents omitted because the folder lies below the stub depth
    #[serde(default)]
    pub stubbed: bool,
    /// Ids of the folder's visible items, grouped by kind
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<ItemKind, Vec<ItemId>>,
    /// Full summaries of tags, on the tags folder only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<ItemSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subfolders: Vec<SnapshotFolder>,
}

impl SnapshotFolder {
    /// Number of folders in this subtree, this one included
    pub fn folder_count(&self) -> usize {
        1 + self
            .subfolders
            .iter()
            .map(SnapshotFolder::folder_count)
            .sum::<usize>()
    }

    /// Number of item ids and tags in this subtree
    pub fn item_count(&self) -> usize {
        self.items.values().map(Vec::len).sum::<usize>()
            + self.tags.len()
            + self
                .subfolders
                .iter()
                .map(SnapshotFolder::item_count)
                .sum::<usize>()
    }

    /// Find a folder anywhere in this subtree
    pub fn find(&self, id: FolderId) -> Option<&SnapshotFolder> {
        if self.folder.id == id {
            return Some(self);
        }
        self.subfolders.iter().find_map(|f| f.find(id))
    }

    /// Ids of one kind held directly by this folder
    pub fn ids_of(&self, kind: ItemKind) -> &[ItemId] {
        self.items.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Build the snapshot of the scope's subtree as it is now
pub fn snapshot(
    reader: &dyn MailboxLogReader,
    scope: &ScopeFilter,
    stub_depth: Option<usize>,
) -> Result<SnapshotFolder> {
    let folders = reader.list_folders()?;
    let mut children: HashMap<FolderId, Vec<&MailItem>> = HashMap::new();
    let mut by_id: HashMap<FolderId, &MailItem> = HashMap::new();
    for folder in &folders {
        by_id.insert(folder.id, folder);
        if !folder.is_root() {
            children.entry(folder.folder_id).or_default().push(folder);
        }
    }

    let root_id = scope.root().unwrap_or(system::ROOT);
    let root = by_id
        .get(&root_id)
        .copied()
        .ok_or_else(|| anyhow!("Snapshot root {} is not a live folder", root_id))?;

    let builder = SnapshotBuilder {
        reader,
        scope,
        stub_depth,
        children,
    };
    builder.build(root, 0)
}

struct SnapshotBuilder<'a> {
    reader: &'a dyn MailboxLogReader,
    scope: &'a ScopeFilter,
    stub_depth: Option<usize>,
    children: HashMap<FolderId, Vec<&'a MailItem>>,
}

impl SnapshotBuilder<'_> {
    fn build(&self, folder: &MailItem, depth: usize) -> Result<SnapshotFolder> {
        let mut node = SnapshotFolder {
            folder: ItemSummary::from_item(folder, NOTHING_SEEN),
            stubbed: false,
            items: BTreeMap::new(),
            tags: Vec::new(),
            subfolders: Vec::new(),
        };

        if self.stub_depth.is_some_and(|max| depth > max) {
            node.stubbed = true;
            return Ok(node);
        }
        if !folder.kind.is_container() {
            return Ok(node);
        }

        for item in self.reader.items_in_folder(folder.id)? {
            let visible = match item.kind {
                ItemKind::Tag => {
                    node.tags.push(ItemSummary::from_item(&item, NOTHING_SEEN));
                    continue;
                }
                ItemKind::Conversation => self.scope.admit(self.reader, &item)?,
                _ => self.scope.passes_cutoff(&item),
            };
            if visible {
                node.items.entry(item.kind).or_default().push(item.id);
            }
        }

        if let Some(subfolders) = self.children.get(&folder.id) {
            for subfolder in subfolders {
                node.subfolders.push(self.build(subfolder, depth + 1)?);
            }
        }

        Ok(node)
    }
}
