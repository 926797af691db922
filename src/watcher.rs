//! Emits ordered local filesystem change events from the sync root.
//!
//! Grounded on the debounced `notify`-crate watcher pattern in
//! `examples/itsharex-aeroftp/src-tauri/src/file_watcher.rs` (native
//! watcher plus a `PollWatcher` fallback for unreliable filesystems), with
//! the ignore-registration-to-suppress-echo-events behaviour this spec's
//! `§4.4` requires added on top (not present in that reference).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use walkdir::WalkDir;

const IGNORE_EXPIRY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Moved,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    pub dest_path: Option<PathBuf>,
    pub is_directory: bool,
}

/// A caller-registered expectation that a coming watcher event was
/// self-caused and should be swallowed rather than forwarded.
#[derive(Clone)]
struct IgnoreEntry {
    kind: FsEventKind,
    src: PathBuf,
    dest: Option<PathBuf>,
    recursive: bool,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct IgnoreRegistry {
    entries: Arc<Mutex<Vec<IgnoreEntry>>>,
}

impl IgnoreRegistry {
    pub fn register(&self, kind: FsEventKind, src: &Path, dest: Option<&Path>, recursive: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.expires_at > Instant::now());
        entries.push(IgnoreEntry {
            kind,
            src: src.to_path_buf(),
            dest: dest.map(|p| p.to_path_buf()),
            recursive,
            expires_at: Instant::now() + IGNORE_EXPIRY,
        });
    }

    /// Returns true (and consumes the registration) if `event` matches a
    /// pending self-caused expectation.
    fn consume_if_matches(&self, kind: FsEventKind, path: &Path) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|e| e.expires_at > now);
        if let Some(idx) = entries.iter().position(|e| {
            e.kind == kind
                && (e.src == path
                    || e.dest.as_deref() == Some(path)
                    || (e.recursive && path.starts_with(&e.src)))
        }) {
            entries.remove(idx);
            true
        } else {
            false
        }
    }
}

pub struct FileSystemWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FsEvent>,
}

impl FileSystemWatcher {
    /// `ignore` is the registry the caller also holds on to (e.g. as part
    /// of its own shared state) so registrations made before this call
    /// returns are already visible to the filtering thread spawned below.
    pub fn start(root: impl Into<PathBuf>, ignore: IgnoreRegistry) -> Result<Self> {
        let root = root.into();
        let (raw_tx, raw_rx) = std_mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )
        .context("create filesystem watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for res in raw_rx {
                let Ok(event) = res else { continue };
                for fs_event in translate(&event) {
                    if ignore.consume_if_matches(fs_event.kind, &fs_event.path) {
                        continue;
                    }
                    if tx.send(fs_event).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Self {
            root,
            _watcher: watcher,
            rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn recv(&mut self) -> Option<FsEvent> {
        self.rx.recv().await
    }
}

fn translate(event: &notify::Event) -> Vec<FsEvent> {
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

    let is_directory = event
        .paths
        .first()
        .map(|p| p.is_dir())
        .unwrap_or(false);

    match &event.kind {
        EventKind::Create(CreateKind::Any) | EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Folder) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                kind: FsEventKind::Created,
                path: p.clone(),
                dest_path: None,
                is_directory,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![FsEvent {
                kind: FsEventKind::Moved,
                path: event.paths[0].clone(),
                dest_path: Some(event.paths[1].clone()),
                is_directory,
            }]
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                kind: FsEventKind::Modified,
                path: p.clone(),
                dest_path: None,
                is_directory,
            })
            .collect(),
        EventKind::Remove(RemoveKind::Any) | EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Folder) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                kind: FsEventKind::Deleted,
                path: p.clone(),
                dest_path: None,
                is_directory,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// A recursive snapshot of relative-path → (is_directory, mtime-seconds)
/// used both by the inactive-period reconciliation (§4.6.1 step 4) and by
/// the polling-diff fallback mentioned in §4.4 for platforms where native
/// event ordering is unreliable.
pub fn snapshot(root: &Path) -> HashMap<PathBuf, (bool, i64)> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.path() == root {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        let mtime = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        out.insert(rel.to_path_buf(), (is_dir, mtime));
    }
    out
}

/// Diffs two snapshots and emits events in the order required by §4.4:
/// `Deleted → Modified → Moved → Created` (this diff never synthesizes
/// `Moved`; a rename surfaces as a delete at the old path and a create at
/// the new one, which the normaliser in `engine.rs` is responsible for
/// recombining when it can detect the pairing).
pub fn diff_snapshots(
    before: &HashMap<PathBuf, (bool, i64)>,
    after: &HashMap<PathBuf, (bool, i64)>,
) -> Vec<FsEvent> {
    let mut deleted = Vec::new();
    let mut modified = Vec::new();
    let mut created = Vec::new();

    for (path, (is_dir, _)) in before {
        if !after.contains_key(path) {
            deleted.push(FsEvent {
                kind: FsEventKind::Deleted,
                path: path.clone(),
                dest_path: None,
                is_directory: *is_dir,
            });
        }
    }
    // directories deleted first among deletions, so a parent delete
    // precedes any child whose own entry also vanished.
    deleted.sort_by_key(|e| (!e.is_directory, e.path.components().count()));

    for (path, (is_dir, mtime)) in after {
        match before.get(path) {
            None => created.push(FsEvent {
                kind: FsEventKind::Created,
                path: path.clone(),
                dest_path: None,
                is_directory: *is_dir,
            }),
            Some((was_dir, was_mtime)) => {
                if was_dir != is_dir {
                    deleted.push(FsEvent {
                        kind: FsEventKind::Deleted,
                        path: path.clone(),
                        dest_path: None,
                        is_directory: *was_dir,
                    });
                    created.push(FsEvent {
                        kind: FsEventKind::Created,
                        path: path.clone(),
                        dest_path: None,
                        is_directory: *is_dir,
                    });
                } else if was_mtime != mtime && !is_dir {
                    modified.push(FsEvent {
                        kind: FsEventKind::Modified,
                        path: path.clone(),
                        dest_path: None,
                        is_directory: *is_dir,
                    });
                }
            }
        }
    }
    // directories created first among creations, so a parent create
    // precedes any child creation.
    created.sort_by_key(|e| (!e.is_directory, e.path.components().count()));

    deleted.into_iter().chain(modified).chain(created).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_registration_consumes_matching_event_once() {
        let registry = IgnoreRegistry::default();
        let path = PathBuf::from("/tmp/a.txt");
        registry.register(FsEventKind::Modified, &path, None, false);
        assert!(registry.consume_if_matches(FsEventKind::Modified, &path));
        assert!(!registry.consume_if_matches(FsEventKind::Modified, &path));
    }

    #[test]
    fn ignore_registration_expires() {
        let registry = IgnoreRegistry::default();
        let path = PathBuf::from("/tmp/a.txt");
        registry.entries.lock().unwrap().push(IgnoreEntry {
            kind: FsEventKind::Modified,
            src: path.clone(),
            dest: None,
            recursive: false,
            expires_at: Instant::now() - Duration::from_secs(1),
        });
        assert!(!registry.consume_if_matches(FsEventKind::Modified, &path));
    }

    #[test]
    fn diff_snapshots_orders_deleted_before_created() {
        let mut before = HashMap::new();
        before.insert(PathBuf::from("old.txt"), (false, 1));
        let mut after = HashMap::new();
        after.insert(PathBuf::from("new.txt"), (false, 2));

        let events = diff_snapshots(&before, &after);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, FsEventKind::Deleted);
        assert_eq!(events[1].kind, FsEventKind::Created);
    }

    #[test]
    fn diff_snapshots_directory_delete_precedes_sibling_deletes() {
        let mut before = HashMap::new();
        before.insert(PathBuf::from("dir"), (true, 1));
        before.insert(PathBuf::from("dir/child.txt"), (false, 1));
        let after = HashMap::new();

        let events = diff_snapshots(&before, &after);
        assert_eq!(events[0].path, PathBuf::from("dir"));
    }

    #[test]
    fn diff_snapshots_detects_modification() {
        let mut before = HashMap::new();
        before.insert(PathBuf::from("a.txt"), (false, 1));
        let mut after = HashMap::new();
        after.insert(PathBuf::from("a.txt"), (false, 2));

        let events = diff_snapshots(&before, &after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FsEventKind::Modified);
    }
}
