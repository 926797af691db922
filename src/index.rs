//! SQLite-backed `IndexStore`: the durable index of every remote item ever
//! seen locally, the per-inode hash cache, and the sync-error surface.
//!
//! Follows the host's `SyncJournal` in structure (a thin wrapper around a
//! single `rusqlite::Connection`, explicit transactions for batches) but
//! with the three tables and query shapes this spec's `§3`/`§4.3` define
//! instead of the host's single `sync_journal` table.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{SyncErrorCode, SyncErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "folder" => Self::Folder,
            _ => Self::File,
        }
    }
}

/// One row of the `index` table: a remote item ever seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub dbx_path_lower: String,
    pub dbx_path_cased: String,
    pub dbx_id: String,
    pub item_type: ItemType,
    pub last_sync: i64,
    pub rev: String,
    pub content_hash: Option<String>,
    pub symlink_target: Option<String>,
}

impl IndexEntry {
    pub fn folder(dbx_path_lower: impl Into<String>, dbx_path_cased: impl Into<String>, dbx_id: impl Into<String>, last_sync: i64) -> Self {
        Self {
            dbx_path_lower: dbx_path_lower.into(),
            dbx_path_cased: dbx_path_cased.into(),
            dbx_id: dbx_id.into(),
            item_type: ItemType::Folder,
            last_sync,
            rev: "folder".to_string(),
            content_hash: Some("folder".to_string()),
            symlink_target: None,
        }
    }
}

/// One row of the `hash_cache` table, keyed by inode; valid only while
/// `(inode, mtime)` still matches the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub inode: u64,
    pub local_path: String,
    pub mtime: i64,
    pub hash_str: String,
}

/// One row of the `sync_errors` table: an unresolved per-item problem.
#[derive(Debug, Clone)]
pub struct SyncErrorEntry {
    pub dbx_path_lower: String,
    pub local_path: Option<String>,
    pub direction: String,
    pub title: String,
    pub message: String,
    pub code: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS "index" (
    dbx_path_lower  TEXT PRIMARY KEY,
    dbx_path_cased  TEXT NOT NULL,
    dbx_id          TEXT NOT NULL,
    item_type       TEXT NOT NULL,
    last_sync       INTEGER NOT NULL,
    rev             TEXT NOT NULL,
    content_hash    TEXT,
    symlink_target  TEXT
);

CREATE TABLE IF NOT EXISTS hash_cache (
    inode       INTEGER PRIMARY KEY,
    local_path  TEXT NOT NULL,
    mtime       INTEGER NOT NULL,
    hash_str    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_errors (
    dbx_path_lower  TEXT PRIMARY KEY,
    local_path      TEXT,
    direction       TEXT NOT NULL,
    title           TEXT NOT NULL,
    message         TEXT NOT NULL,
    code            TEXT NOT NULL
);
"#;

/// Single-writer SQLite database per configuration, behind `WAL` +
/// `synchronous=NORMAL` pragmas as required by §4.3.
pub struct IndexStore {
    conn: Connection,
}

impl IndexStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open index db {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("set journal_mode=WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("set synchronous=NORMAL")?;
        conn.execute_batch(SCHEMA).context("init index schema")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory index db")?;
        conn.execute_batch(SCHEMA).context("init index schema")?;
        Ok(Self { conn })
    }

    fn fatal<T>(res: rusqlite::Result<T>, what: &str) -> Result<T, SyncErrorKind> {
        res.map_err(|e| SyncErrorKind::Database(format!("{what}: {e}")))
    }

    pub fn get(&self, dbx_path_lower: &str) -> Result<Option<IndexEntry>, SyncErrorKind> {
        let row = Self::fatal(
            self.conn
                .query_row(
                    "SELECT dbx_path_lower, dbx_path_cased, dbx_id, item_type, last_sync, rev, content_hash, symlink_target \
                     FROM \"index\" WHERE dbx_path_lower = ?1",
                    params![dbx_path_lower],
                    |row| {
                        Ok(IndexEntry {
                            dbx_path_lower: row.get(0)?,
                            dbx_path_cased: row.get(1)?,
                            dbx_id: row.get(2)?,
                            item_type: ItemType::from_str(&row.get::<_, String>(3)?),
                            last_sync: row.get(4)?,
                            rev: row.get(5)?,
                            content_hash: row.get(6)?,
                            symlink_target: row.get(7)?,
                        })
                    },
                )
                .optional(),
            "get index entry",
        )?;
        Ok(row)
    }

    pub fn put(&self, entry: &IndexEntry) -> Result<(), SyncErrorKind> {
        Self::fatal(
            self.conn.execute(
                "INSERT INTO \"index\" (dbx_path_lower, dbx_path_cased, dbx_id, item_type, last_sync, rev, content_hash, symlink_target) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(dbx_path_lower) DO UPDATE SET \
                   dbx_path_cased=excluded.dbx_path_cased, dbx_id=excluded.dbx_id, item_type=excluded.item_type, \
                   last_sync=excluded.last_sync, rev=excluded.rev, content_hash=excluded.content_hash, \
                   symlink_target=excluded.symlink_target",
                params![
                    entry.dbx_path_lower,
                    entry.dbx_path_cased,
                    entry.dbx_id,
                    entry.item_type.as_str(),
                    entry.last_sync,
                    entry.rev,
                    entry.content_hash,
                    entry.symlink_target,
                ],
            ),
            "put index entry",
        )?;
        Ok(())
    }

    pub fn delete(&self, dbx_path_lower: &str) -> Result<(), SyncErrorKind> {
        Self::fatal(
            self.conn.execute(
                "DELETE FROM \"index\" WHERE dbx_path_lower = ?1",
                params![dbx_path_lower],
            ),
            "delete index entry",
        )?;
        Ok(())
    }

    /// Rows whose `dbx_path_lower` equals `prefix` or has it as a
    /// directory-prefix ancestor.
    pub fn iter_subtree(&self, prefix: &str) -> Result<Vec<IndexEntry>, SyncErrorKind> {
        let child_prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut stmt = Self::fatal(
            self.conn.prepare(
                "SELECT dbx_path_lower, dbx_path_cased, dbx_id, item_type, last_sync, rev, content_hash, symlink_target \
                 FROM \"index\" WHERE dbx_path_lower = ?1 OR substr(dbx_path_lower, 1, ?2) = ?3",
            ),
            "prepare iter_subtree",
        )?;
        let rows = Self::fatal(
            stmt.query_map(
                params![prefix, child_prefix.len() as i64, child_prefix],
                |row| {
                    Ok(IndexEntry {
                        dbx_path_lower: row.get(0)?,
                        dbx_path_cased: row.get(1)?,
                        dbx_id: row.get(2)?,
                        item_type: ItemType::from_str(&row.get::<_, String>(3)?),
                        last_sync: row.get(4)?,
                        rev: row.get(5)?,
                        content_hash: row.get(6)?,
                        symlink_target: row.get(7)?,
                    })
                },
            ),
            "iter_subtree",
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::fatal(row, "read iter_subtree row")?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<i64, SyncErrorKind> {
        Self::fatal(
            self.conn
                .query_row("SELECT COUNT(*) FROM \"index\"", [], |r| r.get(0)),
            "count index",
        )
    }

    pub fn clear(&self) -> Result<(), SyncErrorKind> {
        Self::fatal(self.conn.execute("DELETE FROM \"index\"", []), "clear index")?;
        Ok(())
    }

    /// Applies a batch of mutations atomically, as required by invariant 5
    /// (cursor update must be atomic with the index mutations it reflects).
    pub fn apply_batch<F>(&mut self, f: F) -> Result<(), SyncErrorKind>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<()>,
    {
        let tx = Self::fatal(self.conn.transaction(), "begin index transaction")?;
        Self::fatal(f(&tx), "apply index batch")?;
        Self::fatal(tx.commit(), "commit index transaction")?;
        Ok(())
    }

    // --- hash_cache ---

    pub fn get_hash_cache(&self, inode: u64) -> Result<Option<HashCacheEntry>, SyncErrorKind> {
        Self::fatal(
            self.conn
                .query_row(
                    "SELECT inode, local_path, mtime, hash_str FROM hash_cache WHERE inode = ?1",
                    params![inode as i64],
                    |row| {
                        Ok(HashCacheEntry {
                            inode: row.get::<_, i64>(0)? as u64,
                            local_path: row.get(1)?,
                            mtime: row.get(2)?,
                            hash_str: row.get(3)?,
                        })
                    },
                )
                .optional(),
            "get hash cache entry",
        )
    }

    pub fn put_hash_cache(&self, entry: &HashCacheEntry) -> Result<(), SyncErrorKind> {
        Self::fatal(
            self.conn.execute(
                "INSERT INTO hash_cache (inode, local_path, mtime, hash_str) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(inode) DO UPDATE SET local_path=excluded.local_path, mtime=excluded.mtime, hash_str=excluded.hash_str",
                params![entry.inode as i64, entry.local_path, entry.mtime, entry.hash_str],
            ),
            "put hash cache entry",
        )?;
        Ok(())
    }

    // --- sync_errors ---

    pub fn put_sync_error(&self, err: &SyncErrorEntry) -> Result<(), SyncErrorKind> {
        Self::fatal(
            self.conn.execute(
                "INSERT INTO sync_errors (dbx_path_lower, local_path, direction, title, message, code) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(dbx_path_lower) DO UPDATE SET local_path=excluded.local_path, direction=excluded.direction, \
                   title=excluded.title, message=excluded.message, code=excluded.code",
                params![err.dbx_path_lower, err.local_path, err.direction, err.title, err.message, err.code],
            ),
            "put sync error",
        )?;
        Ok(())
    }

    pub fn clear_sync_error(&self, dbx_path_lower: &str) -> Result<(), SyncErrorKind> {
        Self::fatal(
            self.conn.execute(
                "DELETE FROM sync_errors WHERE dbx_path_lower = ?1",
                params![dbx_path_lower],
            ),
            "clear sync error",
        )?;
        Ok(())
    }

    pub fn list_sync_errors(&self) -> Result<Vec<SyncErrorEntry>, SyncErrorKind> {
        let mut stmt = Self::fatal(
            self.conn
                .prepare("SELECT dbx_path_lower, local_path, direction, title, message, code FROM sync_errors"),
            "prepare list_sync_errors",
        )?;
        let rows = Self::fatal(
            stmt.query_map([], |row| {
                Ok(SyncErrorEntry {
                    dbx_path_lower: row.get(0)?,
                    local_path: row.get(1)?,
                    direction: row.get(2)?,
                    title: row.get(3)?,
                    message: row.get(4)?,
                    code: row.get(5)?,
                })
            }),
            "list_sync_errors",
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::fatal(row, "read sync error row")?);
        }
        Ok(out)
    }
}

/// Records a recoverable per-item error into `sync_errors`, matching the
/// propagation policy of §7: the item is retried next time it changes or
/// on `retry_failed_paths()`.
pub fn record_sync_error(
    store: &IndexStore,
    dbx_path_lower: &str,
    local_path: Option<&str>,
    direction: &str,
    kind: &SyncErrorKind,
) -> Result<(), SyncErrorKind> {
    let code = match kind {
        SyncErrorKind::Sync { code, .. } => code.to_string(),
        other => other.title().to_string(),
    };
    store.put_sync_error(&SyncErrorEntry {
        dbx_path_lower: dbx_path_lower.to_string(),
        local_path: local_path.map(|s| s.to_string()),
        direction: direction.to_string(),
        title: kind.title().to_string(),
        message: kind.to_string(),
        code,
    })
}

#[allow(dead_code)]
fn unused_error_code_hint(_c: SyncErrorCode) {}
