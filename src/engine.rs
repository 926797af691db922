//! `SyncEngine`: startup, the control state machine, local event
//! normalisation, the up/down pipelines, conflict resolution, selective
//! sync and `.mignore` (§4.6).
//!
//! Grounded on the host's `Client` (`client.rs`)/`sync.rs` for the overall
//! shape of a long-running engine object wrapping a journal, a watcher and
//! worker pools started on `start_with_shutdown`, generalised here into the
//! pipeline/consolidation/conflict machinery this spec's up/down semantics
//! require (none of which the host needed, since its sync model is a flat
//! blob mirror rather than a bidirectional Dropbox-style journal).

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::time::Instant as TokioInstant;

use crate::config::Config;
use crate::errors::{SyncErrorCode, SyncErrorKind};
use crate::filters::SyncFilters;
use crate::index::{record_sync_error, HashCacheEntry, IndexEntry, IndexStore, ItemType};
use crate::pathmap::{self, cc_name, ConflictReason, PathMap};
use crate::remote::{FolderMetadata, Metadata, RemoteClient, RemoteChangeStream, WriteMode};
use crate::state::StateStore;
use crate::watcher::{self, FileSystemWatcher, FsEvent, FsEventKind, IgnoreRegistry};
use crate::workspace::{self, WorkspaceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Indexing,
    Running,
    Paused,
    Rebuilding,
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(6)
}

struct Shared {
    root: PathBuf,
    pathmap: PathMap,
    filters: SyncFilters,
    index: StdMutex<IndexStore>,
    state: AsyncMutex<StateStore>,
    remote: Arc<dyn RemoteClient>,
    ignore: IgnoreRegistry,
    control: StdMutex<EngineState>,
    path_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    upload_permits: Semaphore,
    download_permits: Semaphore,
    stop: Arc<Notify>,
    stopped: AtomicBool,
}

impl Shared {
    /// Returns the serialisation lock for the top-level path segment of
    /// `dbx_path_lower`, so concurrent operations under the same top-level
    /// directory never interleave (§4.6.4/§4.6.5 "share a prefix").
    fn lock_for_path(self: &Arc<Self>, dbx_path_lower: &str) -> Arc<AsyncMutex<()>> {
        let key = dbx_path_lower.split('/').next().unwrap_or(dbx_path_lower).to_string();
        let mut table = self.path_locks.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    _lock: WorkspaceLock,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    /// Runs §4.6.1 startup and spawns the watcher, remote-change loop and
    /// both pipelines. Returns once everything is running.
    pub async fn start(config: &Config, remote: Arc<dyn RemoteClient>) -> Result<Self> {
        let state_dir = config.state_dir();
        let lock = WorkspaceLock::try_lock(&state_dir).context("acquire single-instance lock")?;
        workspace::ensure_dropbox_dir(&config.dropbox_path)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("verify sync root")?;

        let index = IndexStore::open(&state_dir.join("index.db")).context("open index store")?;
        let state_store = StateStore::load(&state_dir).context("load sync state")?;
        let filters = SyncFilters::load(&config.dropbox_path).context("load .mignore")?;
        let pathmap = PathMap::new(&config.dropbox_path);

        let ignore = IgnoreRegistry::default();

        let shared = Arc::new(Shared {
            root: config.dropbox_path.clone(),
            pathmap,
            filters,
            index: StdMutex::new(index),
            state: AsyncMutex::new(state_store),
            remote,
            ignore: ignore.clone(),
            control: StdMutex::new(EngineState::Indexing),
            path_locks: StdMutex::new(HashMap::new()),
            upload_permits: Semaphore::new(worker_count()),
            download_permits: Semaphore::new(worker_count()),
            stop: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        });

        let remote_cursor_empty = { shared.state.lock().await.get().remote_cursor.is_empty() };
        if remote_cursor_empty {
            initial_index(&shared).await?;
        } else {
            reconcile_inactive_period(&shared).await?;
        }

        *shared.control.lock().unwrap() = EngineState::Running;

        let mut tasks = Vec::new();
        let watcher = FileSystemWatcher::start(&shared.root, ignore).context("start filesystem watcher")?;
        tasks.push(spawn_up_pipeline(shared.clone(), watcher));
        tasks.push(spawn_down_pipeline(shared.clone()));

        Ok(Self { shared, _lock: lock, tasks: StdMutex::new(tasks) })
    }

    pub fn state(&self) -> EngineState {
        *self.shared.control.lock().unwrap()
    }

    pub fn pause(&self) {
        let mut s = self.shared.control.lock().unwrap();
        if *s == EngineState::Running {
            *s = EngineState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut s = self.shared.control.lock().unwrap();
        if *s == EngineState::Paused {
            *s = EngineState::Running;
        }
    }

    /// Stops the engine in place. Takes `&self` (rather than consuming
    /// `self`) so the control plane can hold the engine behind an `Arc`
    /// and call this from an HTTP shutdown handler.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        *self.shared.control.lock().unwrap() = EngineState::Stopped;
        self.shared.stop.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for t in handles {
            let _ = t.await;
        }
    }

    /// Marks `path` excluded, deletes its local subtree (ignoring the
    /// deletion events that causes) and drops its index rows, per §4.6.7.
    pub async fn exclude(&self, path: &str) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            state.exclude(path)?;
        }
        let norm = pathmap::normalise(path);
        let local = self.shared.pathmap.to_local(&norm);
        if local.exists() {
            self.shared.ignore.register(FsEventKind::Deleted, &local, None, true);
            if local.is_dir() {
                std::fs::remove_dir_all(&local).with_context(|| format!("remove {}", local.display()))?;
            } else {
                std::fs::remove_file(&local).with_context(|| format!("remove {}", local.display()))?;
            }
        }
        let rows = self
            .shared
            .index
            .lock()
            .unwrap()
            .iter_subtree(&norm)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let index = self.shared.index.lock().unwrap();
        for row in rows {
            index.delete(&row.dbx_path_lower).map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Ok(())
    }

    /// Un-excludes `path` and triggers a fresh down-sync of its subtree,
    /// per §4.6.7.
    pub async fn include(&self, path: &str) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            state.include(path)?;
        }
        let norm = pathmap::normalise(path);
        list_and_apply_subtree(&self.shared, &norm).await?;
        Ok(())
    }

    pub fn list_sync_errors(&self) -> Result<Vec<crate::index::SyncErrorEntry>, SyncErrorKind> {
        self.shared.index.lock().unwrap().list_sync_errors()
    }

    /// Rebuilds the index from scratch by re-running initial indexing
    /// against the current remote cursor-less state (§4.6.2 `Rebuilding`).
    pub async fn rebuild_index(&self) -> Result<()> {
        *self.shared.control.lock().unwrap() = EngineState::Rebuilding;
        self.shared.index.lock().unwrap().clear()?;
        {
            let mut state = self.shared.state.lock().await;
            state.set_remote_cursor("")?;
        }
        initial_index(&self.shared).await?;
        *self.shared.control.lock().unwrap() = EngineState::Running;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Startup helpers (§4.6.1)
// ---------------------------------------------------------------------

async fn initial_index(shared: &Arc<Shared>) -> Result<()> {
    let cursor = list_and_apply_subtree(shared, "").await.context("initial list_folder")?;
    shared.state.lock().await.set_remote_cursor(cursor)?;
    Ok(())
}

/// Lists `path` recursively and applies every entry via
/// [`apply_initial_entry`], following `has_more` pages to completion.
/// Returns the cursor the listing ended on. Used both for the one-time
/// startup index (over `""`, the whole root) and for re-running a
/// down-sync of a single subtree after it's re-included (§4.6.7).
async fn list_and_apply_subtree(shared: &Arc<Shared>, path: &str) -> Result<String> {
    let page = shared
        .remote
        .list_folder(path, true)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut cursor = page.cursor;
    let mut entries = page.entries;
    let mut has_more = page.has_more;
    loop {
        for entry in &entries {
            apply_initial_entry(shared, entry).await?;
        }
        if !has_more {
            break;
        }
        let next = shared
            .remote
            .list_folder_continue(&cursor)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        cursor = next.cursor;
        entries = next.entries;
        has_more = next.has_more;
    }
    Ok(cursor)
}

async fn apply_initial_entry(shared: &Arc<Shared>, meta: &Metadata) -> Result<()> {
    match meta {
        Metadata::Folder(f) => {
            let local = shared.pathmap.to_local(&f.path_lower);
            std::fs::create_dir_all(&local).with_context(|| format!("create {}", local.display()))?;
            shared
                .index
                .lock()
                .unwrap()
                .put(&IndexEntry::folder(f.path_lower.clone(), f.path_display.clone(), f.id.clone(), now_epoch()))?;
        }
        Metadata::File(file) => {
            let local = shared.pathmap.to_local(&file.path_lower);
            shared.ignore.register(FsEventKind::Created, &local, None, false);
            shared
                .remote
                .download(&file.path_display, &local)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            shared.index.lock().unwrap().put(&IndexEntry {
                dbx_path_lower: file.path_lower.clone(),
                dbx_path_cased: file.path_display.clone(),
                dbx_id: file.id.clone(),
                item_type: ItemType::File,
                last_sync: now_epoch(),
                rev: file.rev.clone(),
                content_hash: Some(file.content_hash.clone()),
                symlink_target: file.symlink_target.clone(),
            })?;
        }
        Metadata::Deleted { .. } => {}
    }
    Ok(())
}

async fn reconcile_inactive_period(shared: &Arc<Shared>) -> Result<()> {
    let snapshot = watcher::snapshot(&shared.root);
    let indexed: HashMap<PathBuf, (bool, i64)> = {
        let store = shared.index.lock().unwrap();
        store
            .iter_subtree("")?
            .into_iter()
            .map(|e| {
                let local = shared.pathmap.to_local(&e.dbx_path_lower);
                let rel = local.strip_prefix(&shared.root).unwrap_or(&local).to_path_buf();
                (rel, (e.item_type == ItemType::Folder, e.last_sync))
            })
            .collect()
    };
    let events = watcher::diff_snapshots(&indexed, &snapshot);
    for event in events {
        let event = FsEvent {
            kind: event.kind,
            path: shared.root.join(&event.path),
            dest_path: event.dest_path.map(|p| shared.root.join(p)),
            is_directory: event.is_directory,
        };
        if let Err(e) = process_up_event(shared, event).await {
            crate::logging::error(format!("reconciliation event failed: {e}"));
        }
    }
    Ok(())
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

// ---------------------------------------------------------------------
// Up pipeline: watcher -> normaliser -> classify/dispatch (§4.6.3, §4.6.4)
// ---------------------------------------------------------------------

const DEBOUNCE: Duration = Duration::from_millis(500);

fn spawn_up_pipeline(shared: Arc<Shared>, mut watcher: FileSystemWatcher) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, FsEvent> = HashMap::new();
        let mut deadline: Option<TokioInstant> = None;
        loop {
            let sleep = match deadline {
                Some(d) => tokio::time::sleep_until(d),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::select! {
                _ = shared.stop.notified() => return,
                event = watcher.recv() => {
                    let Some(event) = event else { return };
                    consolidate(&mut pending, event);
                    deadline = Some(TokioInstant::now() + DEBOUNCE);
                }
                _ = sleep, if deadline.is_some() => {
                    let batch: Vec<FsEvent> = pending.drain().map(|(_, v)| v).collect();
                    deadline = None;
                    if *shared.control.lock().unwrap() == EngineState::Paused {
                        continue;
                    }
                    for event in batch {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = process_up_event(&shared, event).await {
                                crate::logging::error(format!("up pipeline event failed: {e}"));
                            }
                        });
                    }
                }
            }
        }
    })
}

/// Applies the consolidation table in §4.6.3, keyed per path.
fn consolidate(pending: &mut HashMap<PathBuf, FsEvent>, event: FsEvent) {
    use FsEventKind::*;
    let key = event.path.clone();
    match pending.remove(&key) {
        None => {
            pending.insert(key, event);
        }
        Some(prior) => match (prior.kind, event.kind) {
            (Created, Deleted) => {}
            (Deleted, Created) => {
                pending.insert(key, FsEvent { kind: Modified, ..event });
            }
            (Created, Modified) => {
                pending.insert(key, FsEvent { kind: Created, ..event });
            }
            (Modified, Modified) => {
                pending.insert(key, event);
            }
            _ => {
                pending.insert(key, event);
            }
        },
    }
}

async fn process_up_event(shared: &Arc<Shared>, event: FsEvent) -> Result<(), SyncErrorKind> {
    let Ok(dbx_path) = shared.pathmap.to_dbx(&event.path) else {
        return Ok(());
    };
    let dbx_path_lower = pathmap::normalise(&dbx_path);

    let existing = shared.index.lock().unwrap().get(&dbx_path_lower)?;

    if shared.state.lock().await.is_excluded(&dbx_path_lower) {
        if event.path.exists() {
            let exists = |candidate: &str| shared.pathmap.to_local(candidate).exists();
            let conflict_dbx = cc_name(&dbx_path, ConflictReason::SelectiveSyncConflict, exists);
            let conflict_local = shared.pathmap.to_local(&conflict_dbx);
            shared.ignore.register(FsEventKind::Moved, &event.path, Some(&conflict_local), event.is_directory);
            std::fs::rename(&event.path, &conflict_local)
                .map_err(|e| crate::errors::io_error_to_sync(&e, &event.path.display().to_string()))?;
        }
        return Ok(());
    }
    if existing.is_none() && shared.filters.is_ignored_abs(&event.path, event.is_directory) {
        return Ok(());
    }

    // A case-differing sibling of an already-synced item appearing under
    // a new name (§4.6.6, E2E scenario 5): the index is keyed by the
    // case-folded path, so `existing` here is the *other* sibling's entry.
    if matches!(event.kind, FsEventKind::Created | FsEventKind::Modified) {
        if let Some(idx) = &existing {
            if idx.dbx_path_cased != dbx_path {
                let prior_local = shared.pathmap.to_local(&idx.dbx_path_cased);
                if prior_local != event.path && prior_local.exists() {
                    return resolve_case_conflict(shared, &event.path, &dbx_path, event.is_directory).await;
                }
            }
        }
    }

    let path_lock = shared.lock_for_path(&dbx_path_lower);
    let _guard = path_lock.lock().await;

    let result = match event.kind {
        FsEventKind::Deleted => up_handle_delete(shared, &dbx_path_lower, existing.as_ref()).await,
        FsEventKind::Moved => {
            let dest = event.dest_path.clone().unwrap_or(event.path.clone());
            let Ok(dst_dbx) = shared.pathmap.to_dbx(&dest) else { return Ok(()) };
            up_handle_move(shared, &dbx_path_lower, &pathmap::normalise(&dst_dbx), &dest).await
        }
        FsEventKind::Created | FsEventKind::Modified => {
            if event.is_directory {
                up_handle_folder(shared, &dbx_path_lower, &dbx_path).await
            } else {
                up_handle_file(shared, &event.path, &dbx_path_lower, &dbx_path, existing.as_ref()).await
            }
        }
    };

    if let Err(kind) = &result {
        let _ = record_sync_error(&shared.index.lock().unwrap(), &dbx_path_lower, Some(&event.path.display().to_string()), "up", kind);
    } else {
        shared.index.lock().unwrap().clear_sync_error(&dbx_path_lower).ok();
    }
    result
}

async fn up_handle_folder(shared: &Arc<Shared>, dbx_path_lower: &str, dbx_path: &str) -> Result<(), SyncErrorKind> {
    let permit = shared.upload_permits.acquire().await.map_err(|_| SyncErrorKind::Connection("semaphore closed".into()))?;
    let result = shared.remote.create_folder(dbx_path).await;
    drop(permit);
    let folder = match result {
        Ok(f) => f,
        Err(SyncErrorKind::Sync { code: SyncErrorCode::Conflict | SyncErrorCode::FolderConflict, .. }) => {
            FolderMetadata { id: String::new(), path_display: dbx_path.to_string(), path_lower: dbx_path_lower.to_string() }
        }
        Err(e) => return Err(e),
    };
    shared.index.lock().unwrap().put(&IndexEntry::folder(folder.path_lower, folder.path_display, folder.id, now_epoch()))?;
    Ok(())
}

async fn up_handle_file(
    shared: &Arc<Shared>,
    local_path: &Path,
    dbx_path_lower: &str,
    dbx_path: &str,
    existing: Option<&IndexEntry>,
) -> Result<(), SyncErrorKind> {
    let content_hash = hashed_content(shared, local_path)?;

    let (mode, skip) = match existing {
        None => (WriteMode::Add, false),
        Some(idx) => {
            let unchanged = idx.content_hash.as_deref() == Some(content_hash.as_str());
            (WriteMode::Update(idx.rev.clone()), unchanged)
        }
    };
    if skip {
        return Ok(());
    }

    let permit = shared.upload_permits.acquire().await.map_err(|_| SyncErrorKind::Connection("semaphore closed".into()))?;
    let client_modified = local_mtime_epoch(local_path);
    let uploaded = shared.remote.upload(local_path, dbx_path, mode, client_modified).await;
    drop(permit);

    let meta = match uploaded {
        Ok(m) => m,
        Err(SyncErrorKind::Sync { code: SyncErrorCode::Conflict, .. }) => {
            return resolve_content_conflict(shared, local_path, dbx_path_lower).await;
        }
        Err(e) => return Err(e),
    };

    shared.index.lock().unwrap().put(&IndexEntry {
        dbx_path_lower: meta.path_lower,
        dbx_path_cased: meta.path_display,
        dbx_id: meta.id,
        item_type: ItemType::File,
        last_sync: now_epoch(),
        rev: meta.rev,
        content_hash: Some(meta.content_hash),
        symlink_target: meta.symlink_target,
    })?;
    Ok(())
}

async fn up_handle_delete(shared: &Arc<Shared>, dbx_path_lower: &str, existing: Option<&IndexEntry>) -> Result<(), SyncErrorKind> {
    if existing.is_none() {
        return Ok(());
    }
    let dbx_path = existing.map(|e| e.dbx_path_cased.clone()).unwrap_or_else(|| dbx_path_lower.to_string());
    match shared.remote.delete(&dbx_path).await {
        Ok(_) | Err(SyncErrorKind::Sync { code: SyncErrorCode::NotFound, .. }) => {
            shared.index.lock().unwrap().delete(dbx_path_lower)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn up_handle_move(shared: &Arc<Shared>, src_lower: &str, dst_lower: &str, dst_local: &Path) -> Result<(), SyncErrorKind> {
    let existing = shared.index.lock().unwrap().get(src_lower)?;
    let Some(existing) = existing else {
        if dst_local.is_dir() {
            return up_handle_folder(shared, dst_lower, dst_lower).await;
        }
        return up_handle_file(shared, dst_local, dst_lower, dst_lower, None).await;
    };

    match shared.remote.move_item(&existing.dbx_path_cased, dst_lower, true).await {
        Ok(meta) => {
            shared.index.lock().unwrap().delete(src_lower)?;
            match meta {
                Metadata::File(f) => {
                    shared.index.lock().unwrap().put(&IndexEntry {
                        dbx_path_lower: f.path_lower,
                        dbx_path_cased: f.path_display,
                        dbx_id: f.id,
                        item_type: ItemType::File,
                        last_sync: now_epoch(),
                        rev: f.rev,
                        content_hash: Some(f.content_hash),
                        symlink_target: f.symlink_target,
                    })?;
                }
                Metadata::Folder(f) => {
                    shared.index.lock().unwrap().put(&IndexEntry::folder(f.path_lower, f.path_display, f.id, now_epoch()))?;
                }
                Metadata::Deleted { .. } => {}
            }
            Ok(())
        }
        Err(SyncErrorKind::Sync { code: SyncErrorCode::NotFound, .. }) => {
            shared.index.lock().unwrap().delete(src_lower)?;
            if dst_local.is_dir() {
                up_handle_folder(shared, dst_lower, dst_lower).await
            } else {
                up_handle_file(shared, dst_local, dst_lower, dst_lower, None).await
            }
        }
        Err(e) => Err(e),
    }
}

/// Renames the local file at `local_path` out of the way under a
/// conflict-copy name and uploads it as a brand-new remote file (§4.6.6
/// requires the conflict copy to exist remotely too, not just locally).
async fn resolve_content_conflict(shared: &Arc<Shared>, local_path: &Path, dbx_path_lower: &str) -> Result<(), SyncErrorKind> {
    let exists = |candidate: &str| shared.pathmap.to_local(candidate).exists();
    let conflict_dbx = cc_name(dbx_path_lower, ConflictReason::ConflictingCopy, exists);
    let conflict_local = shared.pathmap.to_local(&conflict_dbx);
    shared.ignore.register(FsEventKind::Moved, local_path, Some(&conflict_local), false);
    std::fs::rename(local_path, &conflict_local)
        .map_err(|e| crate::errors::io_error_to_sync(&e, &local_path.display().to_string()))?;
    let conflict_lower = pathmap::normalise(&conflict_dbx);
    up_handle_file(shared, &conflict_local, &conflict_lower, &conflict_dbx, None).await
}

/// Same rename-then-upload shape as [`resolve_content_conflict`], for the
/// case where two locally-created siblings differ only in case.
async fn resolve_case_conflict(shared: &Arc<Shared>, local_path: &Path, dbx_path: &str, is_directory: bool) -> Result<(), SyncErrorKind> {
    let exists = |candidate: &str| shared.pathmap.to_local(candidate).exists();
    let conflict_dbx = cc_name(dbx_path, ConflictReason::CaseConflict, exists);
    let conflict_local = shared.pathmap.to_local(&conflict_dbx);
    shared.ignore.register(FsEventKind::Moved, local_path, Some(&conflict_local), is_directory);
    std::fs::rename(local_path, &conflict_local)
        .map_err(|e| crate::errors::io_error_to_sync(&e, &local_path.display().to_string()))?;
    let conflict_lower = pathmap::normalise(&conflict_dbx);
    if is_directory {
        up_handle_folder(shared, &conflict_lower, &conflict_dbx).await
    } else {
        up_handle_file(shared, &conflict_local, &conflict_lower, &conflict_dbx, None).await
    }
}

/// Hashes `local_path`, consulting and refreshing the inode-keyed hash
/// cache (§3, §10.6) instead of always rehashing cold.
fn hashed_content(shared: &Arc<Shared>, local_path: &Path) -> Result<String, SyncErrorKind> {
    let meta = std::fs::metadata(local_path)
        .map_err(|e| crate::errors::io_error_to_sync(&e, &local_path.display().to_string()))?;
    let inode = meta.ino();
    let mtime = meta.mtime();
    let local_str = local_path.display().to_string();

    if let Some(cached) = shared.index.lock().unwrap().get_hash_cache(inode)? {
        if cached.mtime == mtime && cached.local_path == local_str {
            return Ok(cached.hash_str);
        }
    }

    let hash_str = crate::hasher::hash_file(local_path)
        .map_err(|e| crate::errors::io_error_to_sync(&e, &local_str))?;
    shared.index.lock().unwrap().put_hash_cache(&HashCacheEntry {
        inode,
        local_path: local_str,
        mtime,
        hash_str: hash_str.clone(),
    })?;
    Ok(hash_str)
}

fn local_mtime_epoch(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(now_epoch)
}

// ---------------------------------------------------------------------
// Down pipeline: remote change stream -> apply in deterministic order (§4.6.5)
// ---------------------------------------------------------------------

fn spawn_down_pipeline(shared: Arc<Shared>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let stream = RemoteChangeStream::new(shared.remote.clone());
        loop {
            if shared.stopped.load(Ordering::SeqCst) {
                return;
            }
            if *shared.control.lock().unwrap() == EngineState::Paused {
                tokio::select! {
                    _ = shared.stop.notified() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                }
            }

            let cursor = shared.state.lock().await.get().remote_cursor.clone();

            let batch = tokio::select! {
                _ = shared.stop.notified() => return,
                result = stream.poll_batch(&cursor, 60) => result,
            };

            match batch {
                Ok(Some((entries, next_cursor))) => {
                    if let Err(e) = apply_down_batch(&shared, entries).await {
                        crate::logging::error(format!("down pipeline batch failed: {e}"));
                        continue;
                    }
                    if let Err(e) = shared.state.lock().await.set_remote_cursor(next_cursor) {
                        crate::logging::error(format!("persist remote cursor failed: {e}"));
                    }
                }
                Ok(None) => {}
                Err(SyncErrorKind::CursorReset(_)) => {
                    crate::logging::error("remote cursor was reset, re-indexing".to_string());
                    if let Err(e) = initial_index(&shared).await {
                        crate::logging::error(format!("re-index after cursor reset failed: {e}"));
                    }
                }
                Err(e) => {
                    crate::logging::error(format!("remote change poll failed: {e}"));
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    })
}

async fn apply_down_batch(shared: &Arc<Shared>, entries: Vec<Metadata>) -> Result<()> {
    let mut deletes = Vec::new();
    let mut folders = Vec::new();
    let mut files = Vec::new();
    for entry in entries {
        match &entry {
            Metadata::Deleted { .. } => deletes.push(entry),
            Metadata::Folder(_) => folders.push(entry),
            Metadata::File(_) => files.push(entry),
        }
    }
    folders.sort_by_key(|m| m.path_lower().matches('/').count());

    for entry in deletes {
        if let Err(e) = apply_down_delete(shared, entry).await {
            crate::logging::error(format!("down delete failed: {e}"));
        }
    }
    for entry in folders {
        if let Err(e) = apply_down_folder(shared, entry).await {
            crate::logging::error(format!("down folder failed: {e}"));
        }
    }

    let mut handles = Vec::new();
    for entry in files {
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            let permit = shared.download_permits.acquire().await;
            if permit.is_err() {
                return;
            }
            if let Err(e) = apply_down_file(&shared, entry).await {
                crate::logging::error(format!("down file failed: {e}"));
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    Ok(())
}

async fn apply_down_delete(shared: &Arc<Shared>, entry: Metadata) -> Result<()> {
    let dbx_path_lower = entry.path_lower().to_string();
    if shared.state.lock().await.is_excluded(&dbx_path_lower) {
        return Ok(());
    }
    let local = shared.pathmap.to_local(&dbx_path_lower);
    if local.exists() {
        shared.ignore.register(FsEventKind::Deleted, &local, None, true);
        if local.is_dir() {
            let _ = std::fs::remove_dir_all(&local);
        } else {
            let _ = std::fs::remove_file(&local);
        }
    }
    shared.index.lock().unwrap().delete(&dbx_path_lower)?;
    Ok(())
}

async fn apply_down_folder(shared: &Arc<Shared>, entry: Metadata) -> Result<()> {
    let Metadata::Folder(f) = entry else { return Ok(()) };
    if shared.state.lock().await.is_excluded(&f.path_lower) {
        return Ok(());
    }
    let local = shared.pathmap.to_local(&f.path_lower);
    shared.ignore.register(FsEventKind::Created, &local, None, false);
    std::fs::create_dir_all(&local).with_context(|| format!("create {}", local.display()))?;
    shared.index.lock().unwrap().put(&IndexEntry::folder(f.path_lower, f.path_display, f.id, now_epoch()))?;
    Ok(())
}

async fn apply_down_file(shared: &Arc<Shared>, entry: Metadata) -> Result<()> {
    let Metadata::File(meta) = entry else { return Ok(()) };
    if shared.state.lock().await.is_excluded(&meta.path_lower) {
        return Ok(());
    }
    let path_lock = shared.lock_for_path(&meta.path_lower);
    let _guard = path_lock.lock().await;

    let local = shared.pathmap.to_local(&meta.path_lower);
    let existing = shared.index.lock().unwrap().get(&meta.path_lower)?;

    if local.exists() {
        let local_hash = crate::hasher::hash_file(&local).unwrap_or_default();
        if local_hash == meta.content_hash {
            shared.index.lock().unwrap().put(&IndexEntry {
                dbx_path_lower: meta.path_lower.clone(),
                dbx_path_cased: meta.path_display.clone(),
                dbx_id: meta.id.clone(),
                item_type: ItemType::File,
                last_sync: now_epoch(),
                rev: meta.rev.clone(),
                content_hash: Some(meta.content_hash.clone()),
                symlink_target: meta.symlink_target.clone(),
            })?;
            return Ok(());
        }
        let locally_diverged = existing.as_ref().and_then(|e| e.content_hash.as_deref()) != Some(local_hash.as_str());
        if locally_diverged {
            let exists = |candidate: &str| shared.pathmap.to_local(candidate).exists();
            let conflict_dbx = cc_name(&meta.path_lower, ConflictReason::ConflictingCopy, exists);
            let conflict_local = shared.pathmap.to_local(&conflict_dbx);
            shared.ignore.register(FsEventKind::Moved, &local, Some(&conflict_local), false);
            std::fs::rename(&local, &conflict_local).with_context(|| format!("rename {}", local.display()))?;
            let conflict_lower = pathmap::normalise(&conflict_dbx);
            up_handle_file(shared, &conflict_local, &conflict_lower, &conflict_dbx, None)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }

    let tmp = local.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    shared.remote.download(&meta.path_display, &tmp).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let downloaded_hash = crate::hasher::hash_file(&tmp).unwrap_or_default();
    if downloaded_hash != meta.content_hash {
        let _ = std::fs::remove_file(&tmp);
        anyhow::bail!("downloaded content hash mismatch for {}", meta.path_display);
    }
    shared.ignore.register(FsEventKind::Moved, &tmp, Some(&local), false);
    std::fs::rename(&tmp, &local).with_context(|| format!("rename into {}", local.display()))?;

    shared.index.lock().unwrap().put(&IndexEntry {
        dbx_path_lower: meta.path_lower,
        dbx_path_cased: meta.path_display,
        dbx_id: meta.id,
        item_type: ItemType::File,
        last_sync: now_epoch(),
        rev: meta.rev,
        content_hash: Some(meta.content_hash),
        symlink_target: meta.symlink_target,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::FsEventKind;

    #[test]
    fn consolidate_created_then_deleted_drops_event() {
        let mut pending = HashMap::new();
        let path = PathBuf::from("/root/a.txt");
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Created, path: path.clone(), dest_path: None, is_directory: false });
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Deleted, path: path.clone(), dest_path: None, is_directory: false });
        assert!(pending.is_empty());
    }

    #[test]
    fn consolidate_deleted_then_created_becomes_modified() {
        let mut pending = HashMap::new();
        let path = PathBuf::from("/root/a.txt");
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Deleted, path: path.clone(), dest_path: None, is_directory: false });
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Created, path: path.clone(), dest_path: None, is_directory: false });
        assert_eq!(pending.get(&path).unwrap().kind, FsEventKind::Modified);
    }

    #[test]
    fn consolidate_created_then_modified_stays_created() {
        let mut pending = HashMap::new();
        let path = PathBuf::from("/root/a.txt");
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Created, path: path.clone(), dest_path: None, is_directory: false });
        consolidate(&mut pending, FsEvent { kind: FsEventKind::Modified, path: path.clone(), dest_path: None, is_directory: false });
        assert_eq!(pending.get(&path).unwrap().kind, FsEventKind::Created);
    }
}
