//! SQLite-backed mailbox log
//!
//! The `items` table doubles as the change log: every row carries the change
//! id of its latest mutation and rows of deleted items stay behind with
//! `deleted_seq` set. Tombstones and placement history live in their own
//! tables.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::{MailboxLogReader, MailboxWriter, NewItem};
use crate::models::{
    ChangeId, ChangeRecord, DeleteSeq, FolderId, ItemId, ItemKind, MailItem, NO_DELETES,
    Placement, SyncToken, Tombstone, system,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Live and deleted items; change_id is the item's change log entry
            CREATE TABLE items (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                conversation_id INTEGER,
                change_id INTEGER NOT NULL,
                created_change INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                name TEXT,
                subject TEXT,
                deleted_seq INTEGER
            );

            CREATE INDEX idx_items_change_id ON items(change_id);
            CREATE INDEX idx_items_folder
                ON items(folder_id) WHERE deleted_seq IS NULL;
            CREATE INDEX idx_items_conversation
                ON items(conversation_id) WHERE deleted_seq IS NULL;

            -- Container history, one row per create or move
            CREATE TABLE placements (
                item_id INTEGER NOT NULL,
                change_id INTEGER NOT NULL,
                folder_id INTEGER NOT NULL,
                PRIMARY KEY (item_id, change_id)
            );

            -- Tombstone log
            CREATE TABLE tombstones (
                delete_seq INTEGER PRIMARY KEY,
                item_id INTEGER NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                created_change INTEGER NOT NULL,
                member_folders TEXT NOT NULL DEFAULT '[]',
                deleted_at TEXT NOT NULL
            );

            -- Mailbox counters, a single row
            CREATE TABLE mailbox_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_change_id INTEGER NOT NULL,
                last_delete_seq INTEGER NOT NULL,
                next_item_id INTEGER NOT NULL
            );
            "#,
        ),
    ])
}

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read connections shared by concurrent sync requests
const READ_POOL_SIZE: u32 = 8;

type ReadPool = Pool<SqliteConnectionManager>;
type ReadConnection = PooledConnection<SqliteConnectionManager>;

const ITEM_COLUMNS: &str =
    "id, kind, folder_id, conversation_id, change_id, created_change, created_at, name, subject";

const FOLDER_KINDS: &str = "('folder', 'search', 'link')";

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn kind_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<ItemKind> {
    let kind: String = row.get(idx)?;
    kind.parse::<ItemKind>().map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<MailItem> {
    Ok(MailItem {
        id: ItemId(row.get(0)?),
        kind: kind_column(row, 1)?,
        folder_id: ItemId(row.get(2)?),
        conversation_id: row.get::<_, Option<i64>>(3)?.map(ItemId),
        change_id: row.get(4)?,
        created_change: row.get(5)?,
        created_at: time_column(row, 6)?,
        name: row.get(7)?,
        subject: row.get(8)?,
    })
}

fn get_live(conn: &Connection, id: ItemId) -> Result<Option<MailItem>> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ? AND deleted_seq IS NULL"),
            [id.0],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

fn require_live(conn: &Connection, id: ItemId) -> Result<MailItem> {
    get_live(conn, id)?.with_context(|| format!("No such item: {}", id))
}

fn require_container(conn: &Connection, id: FolderId) -> Result<MailItem> {
    let folder = require_live(conn, id)?;
    if !folder.kind.is_container() {
        bail!("Item {} is a {}, not a folder", id, folder.kind);
    }
    Ok(folder)
}

fn query_items(conn: &Connection, filter: &str, id: i64) -> Result<Vec<MailItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM items WHERE deleted_seq IS NULL AND {filter} ORDER BY id"
    ))?;
    let items = stmt
        .query_map([id], item_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

fn load_placements(conn: &Connection, id: ItemId) -> Result<Vec<Placement>> {
    let mut stmt = conn.prepare(
        "SELECT change_id, folder_id FROM placements WHERE item_id = ? ORDER BY change_id ASC",
    )?;
    let placements = stmt
        .query_map([id.0], |row| {
            Ok(Placement::new(row.get(0)?, ItemId(row.get(1)?)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(placements)
}

fn insert_placement(conn: &Connection, id: ItemId, placement: Placement) -> Result<()> {
    conn.execute(
        "INSERT INTO placements (item_id, change_id, folder_id) VALUES (?, ?, ?)",
        params![id.0, placement.change_id, placement.folder_id.0],
    )?;
    Ok(())
}

const TOMBSTONE_COLUMNS: &str =
    "delete_seq, item_id, kind, created_change, member_folders, deleted_at";

/// Tombstone row without its placement history
fn tombstone_from_row(row: &Row<'_>) -> rusqlite::Result<Tombstone> {
    let member_folders: String = row.get(4)?;
    Ok(Tombstone {
        delete_seq: row.get(0)?,
        item_id: ItemId(row.get(1)?),
        kind: kind_column(row, 2)?,
        created_change: row.get(3)?,
        placements: Vec::new(),
        member_folders: serde_json::from_str(&member_folders)
            .map_err(|e| conversion_error(4, e))?,
        deleted_at: time_column(row, 5)?,
    })
}

fn with_placements(conn: &Connection, mut tombstone: Tombstone) -> Result<Tombstone> {
    tombstone.placements = load_placements(conn, tombstone.item_id)?;
    Ok(tombstone)
}

/// The single-row counter table, loaded for the duration of one write
struct Counters {
    last_change_id: ChangeId,
    last_delete_seq: DeleteSeq,
    next_item_id: i64,
}

impl Counters {
    fn load(conn: &Connection) -> Result<Self> {
        let counters = conn.query_row(
            "SELECT last_change_id, last_delete_seq, next_item_id FROM mailbox_state WHERE id = 1",
            [],
            |row| {
                Ok(Self {
                    last_change_id: row.get(0)?,
                    last_delete_seq: row.get(1)?,
                    next_item_id: row.get(2)?,
                })
            },
        )?;
        Ok(counters)
    }

    fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE mailbox_state
             SET last_change_id = ?, last_delete_seq = ?, next_item_id = ?
             WHERE id = 1",
            params![self.last_change_id, self.last_delete_seq, self.next_item_id],
        )?;
        Ok(())
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
}

fn insert_item(conn: &Connection, item: &MailItem) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO items ({ITEM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
        params![
            item.id.0,
            item.kind.as_str(),
            item.folder_id.0,
            item.conversation_id.map(|c| c.0),
            item.change_id,
            item.created_change,
            item.created_at.to_rfc3339(),
            item.name,
            item.subject,
        ],
    )?;
    Ok(())
}

/// Create the counters and system folders of a fresh mailbox
fn bootstrap(conn: &Connection) -> Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO mailbox_state (id, last_change_id, last_delete_seq, next_item_id)
         VALUES (1, 0, ?, ?)",
        params![NO_DELETES, system::FIRST_USER_ID],
    )?;

    let root = MailItem::root_folder(now);
    insert_item(conn, &root)?;
    insert_placement(conn, root.id, Placement::new(0, root.id))?;
    for (id, name) in system::FOLDERS {
        insert_item(conn, &MailItem::system_folder(id, name, now))?;
        insert_placement(conn, id, Placement::new(0, system::ROOT))?;
    }
    Ok(())
}

/// Give a live item a fresh change id
fn bump(conn: &Connection, counters: &mut Counters, id: ItemId) -> Result<MailItem> {
    let change = counters.next_change()?;
    let updated = conn.execute(
        "UPDATE items SET change_id = ? WHERE id = ? AND deleted_seq IS NULL",
        params![change, id.0],
    )?;
    if updated == 0 {
        bail!("No such item: {}", id);
    }
    require_live(conn, id)
}

/// Depth-first list of everything removed along with `item`, `item` last
fn collect_doomed(conn: &Connection, item: &MailItem, doomed: &mut Vec<MailItem>) -> Result<()> {
    match item.kind {
        ItemKind::Folder => {
            for child in query_items(conn, "folder_id = ?1 AND id != folder_id", item.id.0)? {
                collect_doomed(conn, &child, doomed)?;
            }
        }
        ItemKind::Conversation => {
            doomed.extend(query_items(conn, "conversation_id = ?", item.id.0)?);
        }
        _ => {}
    }
    doomed.push(item.clone());
    Ok(())
}

/// Mark a live item deleted and write its tombstone
fn bury(
    conn: &Connection,
    counters: &mut Counters,
    item: &MailItem,
    extra_member_folders: &BTreeSet<FolderId>,
    now: DateTime<Utc>,
) -> Result<Tombstone> {
    let delete_seq = counters.next_delete_seq()?;

    let mut member_folders = extra_member_folders.clone();
    if item.kind == ItemKind::Conversation {
        member_folders.extend(
            query_items(conn, "conversation_id = ?", item.id.0)?
                .into_iter()
                .map(|m| m.folder_id),
        );
    }
    let member_folders: Vec<FolderId> = member_folders.into_iter().collect();

    conn.execute(
        "UPDATE items SET deleted_seq = ? WHERE id = ?",
        params![delete_seq, item.id.0],
    )?;
    conn.execute(
        &format!("INSERT INTO tombstones ({TOMBSTONE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"),
        params![
            delete_seq,
            item.id.0,
            item.kind.as_str(),
            item.created_change,
            serde_json::to_string(&member_folders)?,
            now.to_rfc3339(),
        ],
    )?;

    Ok(Tombstone {
        item_id: item.id,
        kind: item.kind,
        delete_seq,
        created_change: item.created_change,
        placements: load_placements(conn, item.id)?,
        member_folders,
        deleted_at: now,
    })
}

/// Whether `folder` is `ancestor` or lies below it
fn is_within(conn: &Connection, folder: FolderId, ancestor: FolderId) -> Result<bool> {
    let mut current = folder;
    loop {
        if current == ancestor {
            return Ok(true);
        }
        match get_live(conn, current)? {
            Some(item) if !item.is_root() => current = item.folder_id,
            _ => return Ok(false),
        }
    }
}

/// SQLite-backed mailbox
///
/// Writes go through one connection held under a mutex, which serializes
/// them. Reads draw from a pool of read-only connections, so in WAL mode
/// concurrent sync requests neither wait on a writer's transaction nor on
/// each other.
pub struct SqliteMailbox {
    writer: Mutex<Connection>,
    readers: ReadPool,
}

impl SqliteMailbox {
    /// Open (or create) a mailbox database
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let mut writer = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        // WAL lets the read connection proceed while a write transaction is open
        writer.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        migrations()
            .to_latest(&mut writer)
            .context("Failed to run database migrations")?;

        {
            let tx = writer.transaction()?;
            let initialized: i64 =
                tx.query_row("SELECT COUNT(*) FROM mailbox_state", [], |row| row.get(0))?;
            if initialized == 0 {
                bootstrap(&tx)?;
            }
            tx.commit()?;
        }

        writer.busy_timeout(BUSY_TIMEOUT)?;

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA query_only = ON;")
        });
        let readers = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)
            .with_context(|| format!("Failed to open read pool for {:?}", db_path))?;

        log::debug!("Opened mailbox database at {:?}", db_path);

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
        })
    }

    fn read_conn(&self) -> Result<ReadConnection> {
        self.readers
            .get()
            .context("No read connection available")
    }

    fn write_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("Mailbox writer lock poisoned"))
    }
}

impl MailboxLogReader for SqliteMailbox {
    fn high_water_mark(&self) -> Result<SyncToken> {
        let conn = self.read_conn()?;
        let counters = Counters::load(&conn)?;
        Ok(SyncToken::new(
            counters.last_change_id,
            counters.last_delete_seq,
        ))
    }

    fn changes_after(
        &self,
        after: ChangeId,
        upto: ChangeId,
        max: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, change_id FROM items
             WHERE change_id > ? AND change_id <= ?
             ORDER BY change_id ASC LIMIT ?",
        )?;
        let records = stmt
            .query_map(params![after, upto, max as i64], |row| {
                Ok(ChangeRecord {
                    item_id: ItemId(row.get(0)?),
                    kind: kind_column(row, 1)?,
                    change_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn tombstones_after(
        &self,
        after: DeleteSeq,
        upto: DeleteSeq,
        max: usize,
    ) -> Result<Vec<Tombstone>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOMBSTONE_COLUMNS} FROM tombstones
             WHERE delete_seq > ? AND delete_seq <= ?
             ORDER BY delete_seq ASC LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![after, upto, max as i64], tombstone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|tombstone| with_placements(&conn, tombstone))
            .collect()
    }

    fn get_item(&self, id: ItemId) -> Result<Option<MailItem>> {
        let conn = self.read_conn()?;
        get_live(&conn, id)
    }

    fn get_tombstone(&self, id: ItemId) -> Result<Option<Tombstone>> {
        let conn = self.read_conn()?;
        let tombstone = conn
            .query_row(
                &format!("SELECT {TOMBSTONE_COLUMNS} FROM tombstones WHERE item_id = ?"),
                [id.0],
                tombstone_from_row,
            )
            .optional()?;
        tombstone.map(|t| with_placements(&conn, t)).transpose()
    }

    fn placements(&self, id: ItemId) -> Result<Vec<Placement>> {
        let conn = self.read_conn()?;
        load_placements(&conn, id)
    }

    fn conversation_members(&self, conversation: ItemId) -> Result<Vec<MailItem>> {
        let conn = self.read_conn()?;
        query_items(&conn, "conversation_id = ?", conversation.0)
    }

    fn list_folders(&self) -> Result<Vec<MailItem>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE deleted_seq IS NULL AND kind IN {FOLDER_KINDS}
             ORDER BY id"
        ))?;
        let folders = stmt
            .query_map([], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    fn items_in_folder(&self, folder: FolderId) -> Result<Vec<MailItem>> {
        let conn = self.read_conn()?;
        query_items(
            &conn,
            &format!("folder_id = ? AND kind NOT IN {FOLDER_KINDS}"),
            folder.0,
        )
    }
}

impl MailboxWriter for SqliteMailbox {
    fn create(&self, new: NewItem) -> Result<MailItem> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let mut counters = Counters::load(&tx)?;

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
        require_container(&tx, new.folder_id)?;
        if let Some(conversation) = new.conversation_id {
            if new.kind != ItemKind::Message {
                bail!("Only messages can belong to a conversation");
            }
            if require_live(&tx, conversation)?.kind != ItemKind::Conversation {
                bail!("Item {} is not a conversation", conversation);
            }
        }

        let id = counters.next_id()?;
        let change = counters.next_change()?;
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
        insert_item(&tx, &item)?;
        insert_placement(&tx, id, Placement::new(change, item.folder_id))?;
        if let Some(conversation) = item.conversation_id {
            bump(&tx, &mut counters, conversation)?;
        }

        counters.save(&tx)?;
        tx.commit()?;
        Ok(item)
    }

    fn touch(&self, id: ItemId) -> Result<MailItem> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let mut counters = Counters::load(&tx)?;

        let item = bump(&tx, &mut counters, id)?;

        counters.save(&tx)?;
        tx.commit()?;
        Ok(item)
    }

    fn move_item(&self, id: ItemId, folder: FolderId) -> Result<MailItem> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let mut counters = Counters::load(&tx)?;

        let item = require_live(&tx, id)?;
        if id.0 < system::FIRST_USER_ID {
            bail!("System folder {} cannot be moved", id);
        }
        if matches!(item.kind, ItemKind::Tag | ItemKind::Conversation) {
            bail!("A {} cannot be moved between folders", item.kind);
        }
        require_container(&tx, folder)?;
        if matches!(folder, system::TAGS | system::CONVERSATIONS) {
            bail!("Folder {} cannot hold a {}", folder, item.kind);
        }
        if item.kind.is_folder_like() && is_within(&tx, folder, id)? {
            bail!("Cannot move folder {} into its own subtree", id);
        }
        if item.folder_id == folder {
            return Ok(item);
        }

        tx.execute(
            "UPDATE items SET folder_id = ? WHERE id = ?",
            params![folder.0, id.0],
        )?;
        let moved = bump(&tx, &mut counters, id)?;
        insert_placement(&tx, id, Placement::new(moved.change_id, folder))?;
        if let Some(conversation) = moved.conversation_id {
            bump(&tx, &mut counters, conversation)?;
        }

        counters.save(&tx)?;
        tx.commit()?;
        Ok(moved)
    }

    fn delete(&self, id: ItemId) -> Result<Vec<Tombstone>> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let mut counters = Counters::load(&tx)?;
        let now = Utc::now();

        let item = require_live(&tx, id)?;
        if id.0 < system::FIRST_USER_ID {
            bail!("System folder {} cannot be deleted", id);
        }

        let mut doomed = Vec::new();
        collect_doomed(&tx, &item, &mut doomed)?;

        let mut tombstones = Vec::with_capacity(doomed.len());
        let mut vacated: BTreeMap<ItemId, BTreeSet<FolderId>> = BTreeMap::new();
        for victim in &doomed {
            if let Some(conversation) = victim.conversation_id {
                vacated
                    .entry(conversation)
                    .or_default()
                    .insert(victim.folder_id);
            }
            let extra = vacated.get(&victim.id).cloned().unwrap_or_default();
            tombstones.push(bury(&tx, &mut counters, victim, &extra, now)?);
        }

        // Conversations that lost messages: drop when empty, bump otherwise
        for (conversation, folders) in vacated {
            let Some(conv) = get_live(&tx, conversation)? else {
                continue;
            };
            if query_items(&tx, "conversation_id = ?", conversation.0)?.is_empty() {
                tombstones.push(bury(&tx, &mut counters, &conv, &folders, now)?);
            } else {
                bump(&tx, &mut counters, conversation)?;
            }
        }

        counters.save(&tx)?;
        tx.commit()?;
        Ok(tombstones)
    }
}
