//! End-to-end exercise of `SyncEngine` against an in-process fake remote,
//! in the style of the host's own daemon integration tests: start the
//! engine against a real temp directory, mutate the filesystem, and
//! assert the pipeline reacts.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dropsync::config::Config;
use dropsync::engine::{EngineState, SyncEngine};
use dropsync::errors::SyncErrorKind;
use dropsync::remote::{FileMetadata, FolderMetadata, ListFolderResult, Metadata, RemoteClient, WaitResult, WriteMode};

#[derive(Default)]
struct FakeRemote {
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    folders_created: Mutex<Vec<String>>,
    cursor: AtomicUsize,
    /// Paths whose *next* `upload` call should be rejected with a
    /// conflict, simulating a concurrent server-side edit.
    force_conflict: Mutex<std::collections::HashSet<String>>,
}

impl FakeRemote {
    fn force_conflict_once(&self, dbx_path_lower: &str) {
        self.force_conflict.lock().unwrap().insert(dbx_path_lower.to_string());
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn account_info(&self) -> Result<String, SyncErrorKind> {
        Ok("test@example.com".to_string())
    }

    async fn list_folder(&self, _path: &str, _recursive: bool) -> Result<ListFolderResult, SyncErrorKind> {
        Ok(ListFolderResult { entries: Vec::new(), cursor: "cursor-0".to_string(), has_more: false })
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, SyncErrorKind> {
        Ok(ListFolderResult { entries: Vec::new(), cursor: cursor.to_string(), has_more: false })
    }

    async fn get_latest_cursor(&self, _path: &str, _recursive: bool) -> Result<String, SyncErrorKind> {
        Ok("cursor-0".to_string())
    }

    async fn wait_for_remote_changes(&self, _cursor: &str, _timeout_secs: u64) -> Result<WaitResult, SyncErrorKind> {
        // Never reports a remote change; this test only exercises the up pipeline.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(WaitResult { changed: false, backoff: None })
    }

    async fn download(&self, _dbx_path: &str, _to_local: &Path) -> Result<FileMetadata, SyncErrorKind> {
        Err(SyncErrorKind::Server("download not exercised by this test".into()))
    }

    async fn upload(&self, local: &Path, dbx_path: &str, _mode: WriteMode, _client_modified: i64) -> Result<FileMetadata, SyncErrorKind> {
        let lower = dbx_path.to_lowercase();
        if self.force_conflict.lock().unwrap().remove(&lower) {
            return Err(SyncErrorKind::Sync {
                code: dropsync::errors::SyncErrorCode::Conflict,
                message: "simulated concurrent edit".to_string(),
            });
        }
        let bytes = std::fs::read(local).map_err(|e| dropsync::errors::io_error_to_sync(&e, dbx_path))?;
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().unwrap().push((dbx_path.to_string(), bytes.clone()));
        Ok(FileMetadata {
            id: format!("id:{n}"),
            path_display: dbx_path.to_string(),
            path_lower: lower,
            rev: format!("rev{n}"),
            size: bytes.len() as i64,
            content_hash: "deadbeef".to_string(),
            client_modified: 0,
            symlink_target: None,
            shared: false,
            modified_by: None,
        })
    }

    async fn create_folder(&self, dbx_path: &str) -> Result<FolderMetadata, SyncErrorKind> {
        self.folders_created.lock().unwrap().push(dbx_path.to_string());
        Ok(FolderMetadata { id: "folder-id".to_string(), path_display: dbx_path.to_string(), path_lower: dbx_path.to_lowercase() })
    }

    async fn move_item(&self, _src: &str, dst: &str, _autorename: bool) -> Result<Metadata, SyncErrorKind> {
        Ok(Metadata::Deleted { path_lower: dst.to_lowercase() })
    }

    async fn delete(&self, dbx_path: &str) -> Result<Metadata, SyncErrorKind> {
        Ok(Metadata::Deleted { path_lower: dbx_path.to_lowercase() })
    }
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("dropsync-engine-test-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn creating_a_local_file_is_uploaded() {
    let dropbox_path = temp_dir("dropbox");
    let config_dir = temp_dir("config");
    let config_path = config_dir.join("config.json");

    let cfg = Config::new_for_save(&config_path, &dropbox_path, "test@example.com", "https://api.dropboxapi.com", None, None, None).unwrap();

    let remote = Arc::new(FakeRemote::default());
    let engine = SyncEngine::start(&cfg, remote.clone()).await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    std::fs::write(dropbox_path.join("hello.txt"), b"hello world").unwrap();

    let mut uploaded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if remote.uploads.lock().unwrap().iter().any(|(path, _)| path == "/hello.txt") {
            uploaded = true;
            break;
        }
    }
    assert!(uploaded, "expected hello.txt to be uploaded within the debounce window");

    let uploads = remote.uploads.lock().unwrap();
    let (_, bytes) = uploads.iter().find(|(p, _)| p == "/hello.txt").unwrap();
    assert_eq!(bytes, b"hello world");

    engine.stop().await;
    let _ = std::fs::remove_dir_all(&dropbox_path);
    let _ = std::fs::remove_dir_all(&config_dir);
}

#[tokio::test]
async fn concurrent_edit_uploads_a_conflicting_copy() {
    let dropbox_path = temp_dir("dropbox-conflict");
    let config_dir = temp_dir("config-conflict");
    let config_path = config_dir.join("config.json");

    let cfg = Config::new_for_save(&config_path, &dropbox_path, "test@example.com", "https://api.dropboxapi.com", None, None, None).unwrap();

    let remote = Arc::new(FakeRemote::default());
    let engine = SyncEngine::start(&cfg, remote.clone()).await.unwrap();

    std::fs::write(dropbox_path.join("notes.txt"), b"first version").unwrap();
    let mut uploaded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if remote.uploads.lock().unwrap().iter().any(|(path, _)| path == "/notes.txt") {
            uploaded = true;
            break;
        }
    }
    assert!(uploaded, "expected notes.txt to upload before the conflict is introduced");

    // The next upload of /notes.txt is rejected as a conflict, simulating
    // a concurrent remote edit that landed between the two local writes.
    remote.force_conflict_once("/notes.txt");
    std::fs::write(dropbox_path.join("notes.txt"), b"second, diverging version").unwrap();

    let mut conflict_copy_uploaded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if remote
            .uploads
            .lock()
            .unwrap()
            .iter()
            .any(|(path, _)| path.contains("conflicting copy"))
        {
            conflict_copy_uploaded = true;
            break;
        }
    }
    assert!(conflict_copy_uploaded, "expected a conflicting-copy upload after the rejected write");

    let conflict_local = dropbox_path.join("notes (conflicting copy).txt");
    assert!(conflict_local.exists(), "local conflict-copy rename never happened");
    assert_eq!(std::fs::read(&conflict_local).unwrap(), b"second, diverging version");

    engine.stop().await;
    let _ = std::fs::remove_dir_all(&dropbox_path);
    let _ = std::fs::remove_dir_all(&config_dir);
}

#[tokio::test]
async fn excluded_folder_recreated_locally_is_renamed_as_selective_sync_conflict() {
    let dropbox_path = temp_dir("dropbox-selective");
    let config_dir = temp_dir("config-selective");
    let config_path = config_dir.join("config.json");

    let cfg = Config::new_for_save(&config_path, &dropbox_path, "test@example.com", "https://api.dropboxapi.com", None, None, None).unwrap();

    let remote = Arc::new(FakeRemote::default());
    let engine = SyncEngine::start(&cfg, remote.clone()).await.unwrap();

    std::fs::create_dir_all(dropbox_path.join("folder")).unwrap();
    std::fs::write(dropbox_path.join("folder/a.txt"), b"a").unwrap();
    let mut uploaded = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if remote.uploads.lock().unwrap().iter().any(|(path, _)| path == "/folder/a.txt") {
            uploaded = true;
            break;
        }
    }
    assert!(uploaded, "expected folder/a.txt to sync before exclusion");

    engine.exclude("/folder").await.unwrap();
    assert!(!dropbox_path.join("folder").exists(), "exclude should delete the local subtree");

    std::fs::create_dir_all(dropbox_path.join("folder")).unwrap();
    std::fs::write(dropbox_path.join("folder/a.txt"), b"recreated while excluded").unwrap();

    let mut renamed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if dropbox_path.join("folder (selective sync conflict)").exists() {
            renamed = true;
            break;
        }
    }
    assert!(renamed, "expected the recreated folder to be renamed to its selective-sync-conflict name");

    engine.stop().await;
    let _ = std::fs::remove_dir_all(&dropbox_path);
    let _ = std::fs::remove_dir_all(&config_dir);
}

#[tokio::test]
async fn case_differing_sibling_is_renamed_as_case_conflict() {
    let dropbox_path = temp_dir("dropbox-case");
    let config_dir = temp_dir("config-case");
    let config_path = config_dir.join("config.json");

    let cfg = Config::new_for_save(&config_path, &dropbox_path, "test@example.com", "https://api.dropboxapi.com", None, None, None).unwrap();

    let remote = Arc::new(FakeRemote::default());
    let engine = SyncEngine::start(&cfg, remote.clone()).await.unwrap();

    std::fs::create_dir_all(dropbox_path.join("folder")).unwrap();
    let mut synced = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if remote.folders_created.lock().unwrap().iter().any(|p| p == "/folder") {
            synced = true;
            break;
        }
    }
    assert!(synced, "expected /folder to sync before the case-differing sibling appears");

    // Most local filesystems (ext4, APFS default) are case-sensitive, so
    // this creates a genuinely distinct directory entry.
    std::fs::create_dir_all(dropbox_path.join("Folder")).unwrap();

    let mut renamed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if dropbox_path.join("Folder (case conflict)").exists() {
            renamed = true;
            break;
        }
    }
    assert!(renamed, "expected the case-differing sibling to be renamed to its case-conflict name");

    engine.stop().await;
    let _ = std::fs::remove_dir_all(&dropbox_path);
    let _ = std::fs::remove_dir_all(&config_dir);
}

#[tokio::test]
async fn pause_and_resume_toggle_engine_state() {
    let dropbox_path = temp_dir("dropbox-pause");
    let config_dir = temp_dir("config-pause");
    let config_path = config_dir.join("config.json");

    let cfg = Config::new_for_save(&config_path, &dropbox_path, "test@example.com", "https://api.dropboxapi.com", None, None, None).unwrap();

    let remote = Arc::new(FakeRemote::default());
    let engine = SyncEngine::start(&cfg, remote).await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    engine.pause();
    assert_eq!(engine.state(), EngineState::Paused);

    engine.resume();
    assert_eq!(engine.state(), EngineState::Running);

    engine.stop().await;
    let _ = std::fs::remove_dir_all(&dropbox_path);
    let _ = std::fs::remove_dir_all(&config_dir);
}
