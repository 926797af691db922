//! `state.ini`: the small text key-value store living in the config
//! directory alongside `index.db` (§6.1). Holds `remote_cursor`,
//! `local_cursor` and the ancestor-closed `excluded_items` set.
//!
//! Format is deliberately the simplest thing that satisfies "text
//! key-value store" — one `key=value` pair per line, following the same
//! plain key=value convention the host's `logging.rs` already uses for its
//! on-disk log lines.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pathmap::normalise;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub remote_cursor: String,
    pub local_cursor: i64,
    pub excluded_items: BTreeSet<String>,
}

pub struct StateStore {
    path: PathBuf,
    state: SyncState,
}

impl StateStore {
    pub fn load(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create state dir {}", state_dir.display()))?;
        let path = state_dir.join("state.ini");
        let state = if path.exists() {
            parse(&fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?)
        } else {
            SyncState::default()
        };
        Ok(Self { path, state })
    }

    pub fn get(&self) -> &SyncState {
        &self.state
    }

    pub fn set_remote_cursor(&mut self, cursor: impl Into<String>) -> Result<()> {
        self.state.remote_cursor = cursor.into();
        self.save()
    }

    pub fn set_local_cursor(&mut self, cursor: i64) -> Result<()> {
        self.state.local_cursor = cursor;
        self.save()
    }

    /// Adds `path` to the excluded set, collapsing any descendant entries
    /// that are now redundantly covered (invariant 7: ancestor-closed).
    pub fn exclude(&mut self, path: &str) -> Result<()> {
        let norm = normalise(path);
        self.state
            .excluded_items
            .retain(|p| !crate::pathmap::is_equal_or_child(p, &norm) || p == &norm);
        self.state.excluded_items.insert(norm);
        self.save()
    }

    /// Removes `path` and any ancestor entries that would otherwise still
    /// exclude it.
    pub fn include(&mut self, path: &str) -> Result<()> {
        let norm = normalise(path);
        self.state
            .excluded_items
            .retain(|p| !crate::pathmap::is_equal_or_child(&norm, p));
        self.save()
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let norm = normalise(path);
        self.state
            .excluded_items
            .iter()
            .any(|p| crate::pathmap::is_equal_or_child(&norm, p))
    }

    fn save(&self) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!("remote_cursor={}\n", self.state.remote_cursor));
        out.push_str(&format!("local_cursor={}\n", self.state.local_cursor));
        out.push_str(&format!(
            "excluded_items={}\n",
            self.state.excluded_items.iter().cloned().collect::<Vec<_>>().join(",")
        ));
        let tmp = self.path.with_extension("ini.tmp");
        fs::write(&tmp, out).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}

fn parse(contents: &str) -> SyncState {
    let mut state = SyncState::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "remote_cursor" => state.remote_cursor = value.to_string(),
            "local_cursor" => state.local_cursor = value.parse().unwrap_or(0),
            "excluded_items" => {
                state.excluded_items = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sync-state-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn persists_and_reloads_cursor() {
        let dir = temp_dir();
        {
            let mut store = StateStore::load(&dir).unwrap();
            store.set_remote_cursor("cursor-1").unwrap();
            store.set_local_cursor(42).unwrap();
        }
        let store = StateStore::load(&dir).unwrap();
        assert_eq!(store.get().remote_cursor, "cursor-1");
        assert_eq!(store.get().local_cursor, 42);
    }

    #[test]
    fn exclude_then_include_round_trips() {
        let dir = temp_dir();
        let mut store = StateStore::load(&dir).unwrap();
        store.exclude("/Folder").unwrap();
        assert!(store.is_excluded("/folder/sub"));
        store.include("/folder").unwrap();
        assert!(!store.is_excluded("/folder/sub"));
    }

    #[test]
    fn exclude_collapses_existing_descendants() {
        let dir = temp_dir();
        let mut store = StateStore::load(&dir).unwrap();
        store.exclude("/a/b").unwrap();
        store.exclude("/a").unwrap();
        assert_eq!(store.get().excluded_items.len(), 1);
        assert!(store.get().excluded_items.contains("/a"));
    }
}
