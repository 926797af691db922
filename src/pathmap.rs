//! Pure translations between remote (`/`-separated, case-insensitive) paths
//! and local filesystem paths, plus the conflict-copy name generator.

use std::path::{Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Error)]
#[error("{0} is not under the sync root")]
pub struct NotInRoot(pub String);

/// Maps between a local sync root and remote (Dropbox-style) paths.
#[derive(Clone)]
pub struct PathMap {
    root: PathBuf,
}

impl PathMap {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `local` must be under the sync root; returns the `/`-separated
    /// remote path with the root stripped, e.g. `/docs/a.txt`.
    pub fn to_dbx(&self, local: &Path) -> Result<String, NotInRoot> {
        let rel = local
            .strip_prefix(&self.root)
            .map_err(|_| NotInRoot(local.display().to_string()))?;
        let mut out = String::from("/");
        for (i, component) in rel.components().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(&component.as_os_str().to_string_lossy());
        }
        if out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
        Ok(out)
    }

    /// Reverse of [`to_dbx`](Self::to_dbx).
    pub fn to_local(&self, dbx: &str) -> PathBuf {
        let trimmed = dbx.trim_start_matches('/');
        let mut local = self.root.clone();
        for part in trimmed.split('/').filter(|s| !s.is_empty()) {
            local.push(part);
        }
        local
    }
}

/// Unicode NFC normalisation plus ASCII/Unicode case-folding, used to
/// derive the canonical `dbx_path_lower` identifier from a display path.
pub fn normalise(p: &str) -> String {
    p.nfc().collect::<String>().to_lowercase()
}

/// Is `a` strictly nested inside directory `b`? Comparisons run on
/// normalised forms; trailing separators are insignificant.
pub fn is_child(a: &str, b: &str) -> bool {
    let a = normalise(a);
    let b = normalise(b);
    let b_trimmed = b.trim_end_matches('/');
    if a == b_trimmed {
        return false;
    }
    is_equal_or_child_normalised(&a, b_trimmed)
}

/// `is_child` plus equality.
pub fn is_equal_or_child(a: &str, b: &str) -> bool {
    let a = normalise(a);
    let b = normalise(b);
    let b_trimmed = b.trim_end_matches('/');
    is_equal_or_child_normalised(&a, b_trimmed)
}

fn is_equal_or_child_normalised(a: &str, b_trimmed: &str) -> bool {
    let a_trimmed = a.trim_end_matches('/');
    if b_trimmed.is_empty() || b_trimmed == "/" {
        return true;
    }
    a_trimmed == b_trimmed || a_trimmed.starts_with(&format!("{b_trimmed}/"))
}

/// One of the three reasons a conflict copy is created; fixes the suffix
/// text used by [`cc_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    ConflictingCopy,
    SelectiveSyncConflict,
    CaseConflict,
}

impl ConflictReason {
    fn label(self) -> &'static str {
        match self {
            Self::ConflictingCopy => "conflicting copy",
            Self::SelectiveSyncConflict => "selective sync conflict",
            Self::CaseConflict => "case conflict",
        }
    }
}

/// Produces `"<stem> (<reason>).<ext>"`, probing `exists` (local
/// filesystem, then index — the caller composes both checks into one
/// closure) to avoid collisions, appending `" 1"`, `" 2"`, … until free.
pub fn cc_name(p: &str, reason: ConflictReason, mut exists: impl FnMut(&str) -> bool) -> String {
    let path = Path::new(p);
    let parent = path.parent().map(|p| p.to_string_lossy().to_string());
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    let join = |name: &str| -> String {
        match &parent {
            Some(dir) if !dir.is_empty() && dir != "/" => format!("{dir}/{name}"),
            _ => format!("/{name}"),
        }
    };

    let build = |suffix: &str| -> String {
        let base = format!("{stem} ({}{suffix})", reason.label());
        match &ext {
            Some(e) if !e.is_empty() => format!("{base}.{e}"),
            _ => base,
        }
    };

    let candidate = build("");
    let candidate_path = join(&candidate);
    if !exists(&candidate_path) {
        return candidate_path;
    }

    let mut n = 1u32;
    loop {
        let candidate = build(&format!(" {n}"));
        let candidate_path = join(&candidate);
        if !exists(&candidate_path) {
            return candidate_path;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_dbx_strips_root_and_uses_forward_slashes() {
        let map = PathMap::new("/home/alice/Dropbox");
        let dbx = map
            .to_dbx(Path::new("/home/alice/Dropbox/docs/a.txt"))
            .unwrap();
        assert_eq!(dbx, "/docs/a.txt");
    }

    #[test]
    fn to_dbx_rejects_paths_outside_root() {
        let map = PathMap::new("/home/alice/Dropbox");
        assert!(map.to_dbx(Path::new("/home/alice/other/a.txt")).is_err());
    }

    #[test]
    fn to_local_round_trips() {
        let map = PathMap::new("/home/alice/Dropbox");
        let local = map.to_local("/docs/a.txt");
        assert_eq!(local, PathBuf::from("/home/alice/Dropbox/docs/a.txt"));
        assert_eq!(map.to_dbx(&local).unwrap(), "/docs/a.txt");
    }

    #[test]
    fn normalise_case_folds_and_nfc_normalises() {
        assert_eq!(normalise("/Docs/A.TXT"), "/docs/a.txt");
    }

    #[test]
    fn is_child_true_for_nested_false_for_equal() {
        assert!(is_child("/a/b", "/a"));
        assert!(!is_child("/a", "/a"));
        assert!(is_equal_or_child("/a", "/a"));
        assert!(!is_child("/ab", "/a"));
    }

    #[test]
    fn cc_name_avoids_collisions() {
        let mut taken = vec!["/docs/file (conflicting copy).txt".to_string()];
        let name = cc_name("/docs/file.txt", ConflictReason::ConflictingCopy, |p| {
            taken.contains(&p.to_string())
        });
        assert_eq!(name, "/docs/file (conflicting copy 1).txt");
    }

    #[test]
    fn cc_name_increments_past_first_collision() {
        let taken = vec![
            "/docs/file (conflicting copy).txt".to_string(),
            "/docs/file (conflicting copy 1).txt".to_string(),
        ];
        let name = cc_name("/docs/file.txt", ConflictReason::ConflictingCopy, |p| {
            taken.contains(&p.to_string())
        });
        assert_eq!(name, "/docs/file (conflicting copy 2).txt");
    }

    #[test]
    fn cc_name_selective_sync_and_case_conflict_labels() {
        let name = cc_name("/folder", ConflictReason::SelectiveSyncConflict, |_| false);
        assert_eq!(name, "/folder (selective sync conflict)");
        let name = cc_name("/Folder", ConflictReason::CaseConflict, |_| false);
        assert_eq!(name, "/Folder (case conflict)");
    }
}
