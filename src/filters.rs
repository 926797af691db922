//! `.mignore`: a gitignore-like pattern file at the sync root (§4.6.8).
//! Patterns only ever affect upload *decisions* for untracked items; an
//! already-indexed item is never silently dropped by a pattern addition.
//!
//! Grounded on the host's `SyncIgnoreList` (`ignore::gitignore::Gitignore`
//! wrapping a set of default lines plus a user file), retargeted from
//! SyftBox's ACL/marker-file conventions to this engine's own always-ignored
//! set (temp files, conflict copies, the database itself).

use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

const DEFAULT_IGNORE_LINES: &[&str] = &[
    ".mignore",
    ".dropsync/",
    "*.conflicted copy*",
    "*.conflicted copy",
    "**/*.tmp-*",
    "**/.*.tmp-*",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "~$*",
    ".~lock.*",
];

#[derive(Clone)]
pub struct SyncFilters {
    root: PathBuf,
    ignore: Gitignore,
}

impl SyncFilters {
    pub fn load(root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let mignore_path = root.join(".mignore");
        if mignore_path.exists() {
            for line in read_ignore_file(&mignore_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add .mignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build .mignore matcher")?;
        Ok(Self { root: root.to_path_buf(), ignore })
    }

    pub fn empty(root: &Path) -> Self {
        Self { root: root.to_path_buf(), ignore: GitignoreBuilder::new(root).build().unwrap() }
    }

    pub fn is_ignored_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.root).unwrap_or(abs_path);
        self.is_ignored_rel(rel, is_dir)
    }

    pub fn is_ignored_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore.matched_path_or_any_parents(rel_path, is_dir).is_ignore()
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
