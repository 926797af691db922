//! The remote service contract (§6.2) and its HTTP realisation, plus the
//! `RemoteChangeStream` driver that turns long-poll + list-folder-continue
//! into a stream of change batches for the down pipeline (§4.5).
//!
//! `HttpRemoteClient` is grounded on the host's `ApiClient` in `http.rs`:
//! the same `AuthState`/bearer-token/retry-once-on-401 plumbing, adapted
//! from the host's blob-store surface to the Dropbox-style
//! list_folder/upload/download/move/delete surface this spec defines.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::auth::{refresh_auth_tokens, validate_token, AuthTokenResponse};
use crate::errors::SyncErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
    pub rev: String,
    pub size: i64,
    pub content_hash: String,
    pub client_modified: i64,
    #[serde(default)]
    pub symlink_target: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub modified_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
}

/// Tagged variant replacing a class hierarchy for the three kinds of
/// remote metadata an entry can describe (§9 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted { path_lower: String },
}

impl Metadata {
    pub fn path_lower(&self) -> &str {
        match self {
            Self::File(f) => &f.path_lower,
            Self::Folder(f) => &f.path_lower,
            Self::Deleted { path_lower } => path_lower,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WriteMode {
    Add,
    Update(String),
    Overwrite,
}

pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

pub struct WaitResult {
    pub changed: bool,
    pub backoff: Option<u64>,
}

/// The minimal abstract client the engine consumes (§6.2). Implemented by
/// [`HttpRemoteClient`] for production use and by an in-memory fake in
/// tests.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn account_info(&self) -> Result<String, SyncErrorKind>;
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListFolderResult, SyncErrorKind>;
    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, SyncErrorKind>;
    async fn get_latest_cursor(&self, path: &str, recursive: bool) -> Result<String, SyncErrorKind>;
    async fn wait_for_remote_changes(&self, cursor: &str, timeout_secs: u64) -> Result<WaitResult, SyncErrorKind>;
    async fn download(&self, dbx_path: &str, to_local: &Path) -> Result<FileMetadata, SyncErrorKind>;
    async fn upload(
        &self,
        local: &Path,
        dbx_path: &str,
        mode: WriteMode,
        client_modified: i64,
    ) -> Result<FileMetadata, SyncErrorKind>;
    async fn create_folder(&self, dbx_path: &str) -> Result<FolderMetadata, SyncErrorKind>;
    async fn move_item(&self, src: &str, dst: &str, autorename: bool) -> Result<Metadata, SyncErrorKind>;
    async fn delete(&self, dbx_path: &str) -> Result<Metadata, SyncErrorKind>;
}

/// Drives the engine's remote-change loop: long-poll, then drain
/// `list_folder_continue` until `has_more` is false (§4.5).
pub struct RemoteChangeStream {
    client: Arc<dyn RemoteClient>,
}

impl RemoteChangeStream {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    /// Long-polls, then drains all continuation pages. Returns the
    /// combined entries and the final cursor, or `None` if the long-poll
    /// timed out with no changes (caller should just loop again).
    pub async fn poll_batch(
        &self,
        cursor: &str,
        timeout_secs: u64,
    ) -> Result<Option<(Vec<Metadata>, String)>, SyncErrorKind> {
        let wait = self.client.wait_for_remote_changes(cursor, timeout_secs).await?;
        if let Some(backoff) = wait.backoff {
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }
        if !wait.changed {
            return Ok(None);
        }

        let mut entries = Vec::new();
        let mut next_cursor = cursor.to_string();
        loop {
            let page = self.client.list_folder_continue(&next_cursor).await?;
            entries.extend(page.entries);
            next_cursor = page.cursor;
            if !page.has_more {
                break;
            }
        }
        Ok(Some((entries, next_cursor)))
    }
}

/// Above this size, `upload` drives an upload-session instead of a single
/// request (§4.6.4).
const UPLOAD_SESSION_THRESHOLD: usize = 150 * 1024 * 1024;
/// No single upload-session request body exceeds this (§4.6.4: "at most 150
/// MB per request").
const UPLOAD_CHUNK_SIZE: usize = 150 * 1024 * 1024;

pub struct HttpRemoteClient {
    base: String,
    http: HttpClient,
    auth: Arc<AuthState>,
}

struct AuthState {
    email: String,
    access_token: Mutex<Option<String>>,
    refresh_token: Mutex<Option<String>>,
    config_path: Option<std::path::PathBuf>,
}

impl AuthState {
    async fn ensure_access_token_with<F, Fut>(&self, refresh: F) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<AuthTokenResponse>>,
    {
        let needs_refresh = {
            let access = self.access_token.lock().await;
            match access.as_deref() {
                None => true,
                Some(t) => validate_token(t, "access", &self.email).is_err(),
            }
        };
        if !needs_refresh {
            return Ok(());
        }
        let refresh_token = { self.refresh_token.lock().await.clone() };
        let Some(refresh_token) = refresh_token else {
            return Ok(());
        };

        let tokens = refresh(refresh_token.clone()).await?;
        validate_token(&tokens.refresh_token, "refresh", &self.email).context("refresh token")?;
        validate_token(&tokens.access_token, "access", &self.email).context("access token")?;

        *self.access_token.lock().await = Some(tokens.access_token);
        if tokens.refresh_token != refresh_token {
            *self.refresh_token.lock().await = Some(tokens.refresh_token.clone());
            if let Some(path) = &self.config_path {
                let _ = crate::config::save_refresh_token_file_only(path, &tokens.refresh_token);
            }
        }
        Ok(())
    }
}

impl HttpRemoteClient {
    pub fn new(
        base: &str,
        email: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        config_path: Option<&Path>,
    ) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            auth: Arc::new(AuthState {
                email: email.to_string(),
                access_token: Mutex::new(access_token.map(str::to_string)),
                refresh_token: Mutex::new(refresh_token.map(str::to_string)),
                config_path: config_path.map(Path::to_path_buf),
            }),
        })
    }

    async fn ensure_access_token(&self) -> Result<()> {
        self.auth
            .ensure_access_token_with(|refresh| async move {
                refresh_auth_tokens(&self.http, &self.base, &refresh).await
            })
            .await
    }

    async fn send_once(&self, mut req: RequestBuilder) -> Result<Response> {
        if let Some(token) = self.auth.access_token.lock().await.clone() {
            req = req.bearer_auth(token);
        }
        req.send().await.context("http send")
    }

    /// Sends a request, refreshing and retrying exactly once on 401,
    /// following `send_authed` in the host's `http.rs`.
    async fn send_authed<F>(&self, build: F) -> Result<Response, SyncErrorKind>
    where
        F: Fn() -> RequestBuilder,
    {
        let map_io = |e: anyhow::Error| SyncErrorKind::Connection(e.to_string());
        self.ensure_access_token().await.map_err(map_io)?;
        let resp = self.send_once(build()).await.map_err(map_io)?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        if self.auth.refresh_token.lock().await.is_none() {
            return Err(SyncErrorKind::Auth("access token rejected, no refresh token available".into()));
        }
        *self.auth.access_token.lock().await = None;
        self.ensure_access_token().await.map_err(map_io)?;
        self.send_once(build()).await.map_err(map_io)
    }

    fn dbx_path_query(&self, path: &str) -> [(&'static str, String); 1] {
        [("path", path.to_string())]
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, SyncErrorKind> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| SyncErrorKind::Server(format!("parse response: {e}")));
    }
    let text = resp.text().await.unwrap_or_default();
    Err(crate::errors::http_status_to_sync(status.as_u16(), text))
}

async fn parse_status(resp: Response) -> Result<(), SyncErrorKind> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    Err(crate::errors::http_status_to_sync(status.as_u16(), text))
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct WaitResponse {
    changed: bool,
    backoff: Option<u64>,
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn account_info(&self) -> Result<String, SyncErrorKind> {
        let url = format!("{}/2/users/get_current_account", self.base);
        let resp = self.send_authed(|| self.http.post(&url)).await?;
        #[derive(Deserialize)]
        struct AccountInfo {
            account_id: String,
        }
        let info: AccountInfo = parse_json(resp).await?;
        Ok(info.account_id)
    }

    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListFolderResult, SyncErrorKind> {
        let url = format!("{}/2/files/list_folder", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            path: &'a str,
            recursive: bool,
            include_deleted: bool,
        }
        let body = Req { path, recursive, include_deleted: false };
        let resp = self
            .send_authed(|| self.http.post(&url).json(&body))
            .await?;
        let page: ListFolderResponse = parse_json(resp).await?;
        Ok(ListFolderResult { entries: page.entries, cursor: page.cursor, has_more: page.has_more })
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, SyncErrorKind> {
        let url = format!("{}/2/files/list_folder/continue", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            cursor: &'a str,
        }
        let resp = self
            .send_authed(|| self.http.post(&url).json(&Req { cursor }))
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(SyncErrorKind::CursorReset(cursor.to_string()));
        }
        let page: ListFolderResponse = parse_json(resp).await?;
        Ok(ListFolderResult { entries: page.entries, cursor: page.cursor, has_more: page.has_more })
    }

    async fn get_latest_cursor(&self, path: &str, recursive: bool) -> Result<String, SyncErrorKind> {
        let url = format!("{}/2/files/list_folder/get_latest_cursor", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            path: &'a str,
            recursive: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            cursor: String,
        }
        let resp = self
            .send_authed(|| self.http.post(&url).json(&Req { path, recursive }))
            .await?;
        let resp: Resp = parse_json(resp).await?;
        Ok(resp.cursor)
    }

    async fn wait_for_remote_changes(&self, cursor: &str, timeout_secs: u64) -> Result<WaitResult, SyncErrorKind> {
        let timeout_secs = timeout_secs.clamp(30, 480);
        let url = format!("{}/2/files/list_folder/longpoll", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            cursor: &'a str,
            timeout: u64,
        }
        let resp = self
            .http
            .post(&url)
            .json(&Req { cursor, timeout: timeout_secs })
            .timeout(Duration::from_secs(timeout_secs + 30))
            .send()
            .await
            .map_err(|e| SyncErrorKind::Connection(e.to_string()))?;
        let resp: WaitResponse = parse_json(resp).await?;
        Ok(WaitResult { changed: resp.changed, backoff: resp.backoff })
    }

    async fn download(&self, dbx_path: &str, to_local: &Path) -> Result<FileMetadata, SyncErrorKind> {
        let url = format!("{}/2/files/download", self.base);
        let resp = self
            .send_authed(|| self.http.post(&url).query(&self.dbx_path_query(dbx_path)))
            .await?;
        if !resp.status().is_success() {
            return Err(crate::errors::http_status_to_sync(resp.status().as_u16(), dbx_path.to_string()));
        }
        let meta_header = resp
            .headers()
            .get("dropbox-api-result")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("{}")
            .to_string();
        let meta: FileMetadata = serde_json::from_str(&meta_header)
            .map_err(|e| SyncErrorKind::Server(format!("parse download metadata: {e}")))?;

        if let Some(parent) = to_local.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::errors::io_error_to_sync(&e, &to_local.display().to_string()))?;
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SyncErrorKind::Connection(e.to_string()))?;
        std::fs::write(to_local, &bytes)
            .map_err(|e| crate::errors::io_error_to_sync(&e, &to_local.display().to_string()))?;
        Ok(meta)
    }

    async fn upload(
        &self,
        local: &Path,
        dbx_path: &str,
        mode: WriteMode,
        client_modified: i64,
    ) -> Result<FileMetadata, SyncErrorKind> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| crate::errors::io_error_to_sync(&e, &local.display().to_string()))?;
        let mode_str = match &mode {
            WriteMode::Add => "add".to_string(),
            WriteMode::Update(rev) => format!("update:{rev}"),
            WriteMode::Overwrite => "overwrite".to_string(),
        };
        let commit_args = serde_json::json!({
            "path": dbx_path,
            "mode": mode_str,
            "client_modified": client_modified,
            "autorename": true,
        });

        if bytes.len() <= UPLOAD_SESSION_THRESHOLD {
            let url = format!("{}/2/files/upload", self.base);
            let resp = self
                .send_authed(|| {
                    self.http
                        .post(&url)
                        .header("Dropbox-API-Arg", commit_args.to_string())
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .body(bytes.clone())
                })
                .await?;
            return parse_json(resp).await;
        }

        self.upload_chunked(&bytes, &commit_args).await
    }

    /// Large-file path (§4.6.4): splits `bytes` into chunks no larger than
    /// [`UPLOAD_CHUNK_SIZE`] and drives an upload-session start/append/finish
    /// sequence instead of a single request.
    async fn upload_chunked(&self, bytes: &[u8], commit_args: &serde_json::Value) -> Result<FileMetadata, SyncErrorKind> {
        let mut chunks = bytes.chunks(UPLOAD_CHUNK_SIZE);
        let first = chunks.next().unwrap_or(&[]);

        let start_url = format!("{}/2/files/upload_session/start", self.base);
        let resp = self
            .send_authed(|| {
                self.http
                    .post(&start_url)
                    .header("Dropbox-API-Arg", serde_json::json!({"close": false}).to_string())
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(first.to_vec())
            })
            .await?;
        #[derive(Deserialize)]
        struct StartResp {
            session_id: String,
        }
        let StartResp { session_id } = parse_json(resp).await?;

        let mut offset = first.len() as u64;
        let remaining: Vec<&[u8]> = chunks.collect();
        let append_url = format!("{}/2/files/upload_session/append_v2", self.base);
        for (i, chunk) in remaining.iter().enumerate() {
            let is_last = i == remaining.len() - 1;
            let cursor = serde_json::json!({"session_id": session_id, "offset": offset});
            let args = serde_json::json!({"cursor": cursor, "close": is_last});
            let resp = self
                .send_authed(|| {
                    self.http
                        .post(&append_url)
                        .header("Dropbox-API-Arg", args.to_string())
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .body(chunk.to_vec())
                })
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(crate::errors::http_status_to_sync(status.as_u16(), text));
            }
            offset += chunk.len() as u64;
        }

        let finish_url = format!("{}/2/files/upload_session/finish", self.base);
        let cursor = serde_json::json!({"session_id": session_id, "offset": offset});
        let finish_args = serde_json::json!({"cursor": cursor, "commit": commit_args});
        let resp = self
            .send_authed(|| {
                self.http
                    .post(&finish_url)
                    .header("Dropbox-API-Arg", finish_args.to_string())
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            })
            .await?;
        parse_json(resp).await
    }

    async fn create_folder(&self, dbx_path: &str) -> Result<FolderMetadata, SyncErrorKind> {
        let url = format!("{}/2/files/create_folder_v2", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            path: &'a str,
            autorename: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            metadata: FolderMetadata,
        }
        let resp = self
            .send_authed(|| self.http.post(&url).json(&Req { path: dbx_path, autorename: false }))
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(FolderMetadata {
                id: String::new(),
                path_display: dbx_path.to_string(),
                path_lower: dbx_path.to_lowercase(),
            });
        }
        let resp: Resp = parse_json(resp).await?;
        Ok(resp.metadata)
    }

    async fn move_item(&self, src: &str, dst: &str, autorename: bool) -> Result<Metadata, SyncErrorKind> {
        let url = format!("{}/2/files/move_v2", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            from_path: &'a str,
            to_path: &'a str,
            autorename: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            metadata: Metadata,
        }
        let resp = self
            .send_authed(|| {
                self.http
                    .post(&url)
                    .json(&Req { from_path: src, to_path: dst, autorename })
            })
            .await?;
        let resp: Resp = parse_json(resp).await?;
        Ok(resp.metadata)
    }

    async fn delete(&self, dbx_path: &str) -> Result<Metadata, SyncErrorKind> {
        let url = format!("{}/2/files/delete_v2", self.base);
        #[derive(Serialize)]
        struct Req<'a> {
            path: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            metadata: Metadata,
        }
        let resp = self
            .send_authed(|| self.http.post(&url).json(&Req { path: dbx_path }))
            .await?;
        let resp: Resp = parse_json(resp).await?;
        Ok(resp.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory fake implementing the contract, for engine-level tests.
    #[derive(Default)]
    pub struct FakeRemote {
        pub cursor_counter: AtomicUsize,
        pub entries: StdMutex<Vec<Metadata>>,
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn account_info(&self) -> Result<String, SyncErrorKind> {
            Ok("fake-account".to_string())
        }
        async fn list_folder(&self, _path: &str, _recursive: bool) -> Result<ListFolderResult, SyncErrorKind> {
            Ok(ListFolderResult {
                entries: self.entries.lock().unwrap().clone(),
                cursor: "c0".to_string(),
                has_more: false,
            })
        }
        async fn list_folder_continue(&self, _cursor: &str) -> Result<ListFolderResult, SyncErrorKind> {
            Ok(ListFolderResult { entries: vec![], cursor: "c1".to_string(), has_more: false })
        }
        async fn get_latest_cursor(&self, _path: &str, _recursive: bool) -> Result<String, SyncErrorKind> {
            Ok("c0".to_string())
        }
        async fn wait_for_remote_changes(&self, _cursor: &str, _timeout_secs: u64) -> Result<WaitResult, SyncErrorKind> {
            Ok(WaitResult { changed: false, backoff: None })
        }
        async fn download(&self, _dbx_path: &str, _to_local: &Path) -> Result<FileMetadata, SyncErrorKind> {
            Err(SyncErrorKind::sync(crate::errors::SyncErrorCode::NotFound, "not implemented in fake"))
        }
        async fn upload(&self, _local: &Path, dbx_path: &str, _mode: WriteMode, _client_modified: i64) -> Result<FileMetadata, SyncErrorKind> {
            Ok(FileMetadata {
                id: "id".into(),
                path_display: dbx_path.into(),
                path_lower: dbx_path.to_lowercase(),
                rev: "rev1".into(),
                size: 0,
                content_hash: String::new(),
                client_modified: 0,
                symlink_target: None,
                shared: false,
                modified_by: None,
            })
        }
        async fn create_folder(&self, dbx_path: &str) -> Result<FolderMetadata, SyncErrorKind> {
            Ok(FolderMetadata { id: "id".into(), path_display: dbx_path.into(), path_lower: dbx_path.to_lowercase() })
        }
        async fn move_item(&self, _src: &str, dst: &str, _autorename: bool) -> Result<Metadata, SyncErrorKind> {
            Ok(Metadata::Deleted { path_lower: dst.to_lowercase() })
        }
        async fn delete(&self, dbx_path: &str) -> Result<Metadata, SyncErrorKind> {
            Ok(Metadata::Deleted { path_lower: dbx_path.to_lowercase() })
        }
    }

    #[tokio::test]
    async fn poll_batch_returns_none_when_nothing_changed() {
        let client: Arc<dyn RemoteClient> = Arc::new(FakeRemote::default());
        let stream = RemoteChangeStream::new(client);
        let result = stream.poll_batch("c0", 30).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn metadata_path_lower_matches_variant() {
        let m = Metadata::Deleted { path_lower: "/a".into() };
        assert_eq!(m.path_lower(), "/a");
    }
}
