//! Typed error taxonomy for the sync engine, plus the `anyhow` glue that
//! connects it to the rest of the crate's plumbing.

use std::fmt;

use thiserror::Error;

/// Per-item sync error sub-kinds. Stored inside `SyncErrorKind::Sync` and
/// persisted verbatim in a `SyncErrorEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorCode {
    Path,
    InsufficientPermissions,
    InsufficientSpace,
    FileConflict,
    FolderConflict,
    Conflict,
    NotFound,
    IsAFolder,
    NotAFolder,
    FileSize,
    SymlinkError,
    UnsupportedFile,
    RestrictedContent,
    DataCorruption,
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Path => "path",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::InsufficientSpace => "insufficient_space",
            Self::FileConflict => "file_conflict",
            Self::FolderConflict => "folder_conflict",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::IsAFolder => "is_a_folder",
            Self::NotAFolder => "not_a_folder",
            Self::FileSize => "file_size",
            Self::SymlinkError => "symlink_error",
            Self::UnsupportedFile => "unsupported_file",
            Self::RestrictedContent => "restricted_content",
            Self::DataCorruption => "data_corruption",
        };
        f.write_str(s)
    }
}

/// The top-level taxonomy from the error handling design. `Sync` carries a
/// per-item [`SyncErrorCode`]; every other variant is either fatal
/// (`Auth`, `Database`, `NoDropboxDir`, `BadInput`) or governs a retry
/// policy (`Connection`, `CursorReset`, `Server`).
#[derive(Debug, Error)]
pub enum SyncErrorKind {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("{code}: {message}")]
    Sync { code: SyncErrorCode, message: String },

    #[error("remote cursor was reset: {0}")]
    CursorReset(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("dropbox directory is missing or unwritable: {0}")]
    NoDropboxDir(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("server error: {0}")]
    Server(String),
}

impl SyncErrorKind {
    pub fn sync(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self::Sync {
            code,
            message: message.into(),
        }
    }

    /// Errors that must stop the engine outright rather than being
    /// recorded as a per-item `SyncErrorEntry`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::Database(_) | Self::NoDropboxDir(_) | Self::BadInput(_)
        )
    }

    /// A short machine-stable title, matching what the control API and
    /// `SyncErrorEntry::title` surface to a caller.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection error",
            Self::Auth(_) => "Authentication error",
            Self::Sync { code, .. } => match code {
                SyncErrorCode::Path => "Invalid path",
                SyncErrorCode::InsufficientPermissions => "Insufficient permissions",
                SyncErrorCode::InsufficientSpace => "Insufficient space",
                SyncErrorCode::FileConflict => "File conflict",
                SyncErrorCode::FolderConflict => "Folder conflict",
                SyncErrorCode::Conflict => "Conflict",
                SyncErrorCode::NotFound => "Not found",
                SyncErrorCode::IsAFolder => "Expected a file",
                SyncErrorCode::NotAFolder => "Expected a folder",
                SyncErrorCode::FileSize => "File too large",
                SyncErrorCode::SymlinkError => "Symlink error",
                SyncErrorCode::UnsupportedFile => "Unsupported file",
                SyncErrorCode::RestrictedContent => "Restricted content",
                SyncErrorCode::DataCorruption => "Data corruption",
            },
            Self::CursorReset(_) => "Cursor reset",
            Self::Database(_) => "Database error",
            Self::NoDropboxDir(_) => "Dropbox folder missing",
            Self::BadInput(_) => "Internal error",
            Self::Server(_) => "Server error",
        }
    }
}

/// Translate a raw `std::io::Error` encountered while touching the local
/// tree into the taxonomy, mirroring the host's `os_to_maestral_error`.
pub fn io_error_to_sync(err: &std::io::Error, path: &str) -> SyncErrorKind {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied => SyncErrorKind::sync(
            SyncErrorCode::InsufficientPermissions,
            format!("insufficient permissions for {path}"),
        ),
        ErrorKind::NotFound => {
            SyncErrorKind::sync(SyncErrorCode::NotFound, format!("{path} does not exist"))
        }
        _ => SyncErrorKind::sync(SyncErrorCode::Path, format!("{path}: {err}")),
    }
}

/// Translate an HTTP status from the remote client into the taxonomy,
/// mirroring the host's `map_status` in `http.rs`.
pub fn http_status_to_sync(status: u16, message: impl Into<String>) -> SyncErrorKind {
    let message = message.into();
    match status {
        401 | 403 => SyncErrorKind::Auth(message),
        404 => SyncErrorKind::sync(SyncErrorCode::NotFound, message),
        409 => SyncErrorKind::sync(SyncErrorCode::Conflict, message),
        413 => SyncErrorKind::sync(SyncErrorCode::FileSize, message),
        507 | 413 => SyncErrorKind::sync(SyncErrorCode::InsufficientSpace, message),
        500..=599 => SyncErrorKind::Server(message),
        _ => SyncErrorKind::Connection(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_exactly_those_named() {
        assert!(SyncErrorKind::Auth("x".into()).is_fatal());
        assert!(SyncErrorKind::Database("x".into()).is_fatal());
        assert!(SyncErrorKind::NoDropboxDir("x".into()).is_fatal());
        assert!(SyncErrorKind::BadInput("x".into()).is_fatal());
        assert!(!SyncErrorKind::Connection("x".into()).is_fatal());
        assert!(!SyncErrorKind::sync(SyncErrorCode::NotFound, "x").is_fatal());
    }

    #[test]
    fn http_status_maps_auth_and_not_found() {
        assert!(matches!(
            http_status_to_sync(401, "nope"),
            SyncErrorKind::Auth(_)
        ));
        assert!(matches!(
            http_status_to_sync(404, "nope"),
            SyncErrorKind::Sync {
                code: SyncErrorCode::NotFound,
                ..
            }
        ));
        assert!(matches!(
            http_status_to_sync(503, "nope"),
            SyncErrorKind::Server(_)
        ));
    }
}
