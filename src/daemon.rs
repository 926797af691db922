//! Wires `Config` -> `HttpRemoteClient` -> `SyncEngine` -> `ControlPlane`
//! into a runnable daemon, either on the current runtime (`run_daemon_with_shutdown`)
//! or in a dedicated background thread (`start_threaded`), mirroring the host's
//! `run_daemon_with_shutdown`/`start_threaded`/`start_threaded_from_config_path` shape.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::config::{Config, ConfigOverrides};
use crate::control::ControlPlane;
use crate::engine::SyncEngine;
use crate::remote::HttpRemoteClient;

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub control_url: Option<String>,
    pub control_token: Option<String>,
    pub log_path: Option<PathBuf>,
}

pub struct ThreadedDaemonHandle {
    shutdown: std::sync::mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<Result<()>>>,
}

impl ThreadedDaemonHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("dropsync daemon thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Runs the daemon on the *current* tokio runtime until `shutdown` fires.
pub async fn run_daemon_with_shutdown(cfg: Config, opts: DaemonOptions, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    let mut cfg = cfg;
    let (control_addr, control_token) = prepare_control_plane(&mut cfg, opts.control_url, opts.control_token)?;

    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        log_path.display()
    ));

    cfg.save()?;

    let remote = Arc::new(HttpRemoteClient::new(
        &cfg.server_url,
        &cfg.email,
        cfg.access_token.as_deref(),
        cfg.refresh_token.as_deref(),
        cfg.config_path.as_deref(),
    )?) as Arc<dyn crate::remote::RemoteClient>;

    let engine = Arc::new(SyncEngine::start(&cfg, remote).await.context("start sync engine")?);

    let control_result = ControlPlane::start_async(&control_addr, Some(control_token), engine.clone())
        .await
        .context("start control plane")?;
    let control = control_result.control_plane;
    let actual_addr = control_result.bound_addr;

    let actual_control_url = format!("http://{actual_addr}");
    if cfg.control_url.as_deref() != Some(actual_control_url.as_str()) {
        crate::logging::info_kv(
            "control plane bound to different port than configured",
            &[("configured", cfg.control_url.as_deref().unwrap_or("")), ("actual", &actual_control_url)],
        );
        cfg.control_url = Some(actual_control_url);
        if let Err(e) = cfg.save() {
            crate::logging::error(format!("failed to save updated config with actual control plane address: {e}"));
        }
    }
    let _ = &control;

    shutdown.notified().await;
    engine.stop().await;
    Ok(())
}

/// Starts the daemon in a dedicated background thread with its own tokio runtime.
pub fn start_threaded(cfg: Config, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("dropsync-daemon".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;

            rt.block_on(async move {
                let shutdown = Arc::new(tokio::sync::Notify::new());
                let shutdown_task = shutdown.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = shutdown_rx.recv();
                    shutdown_task.notify_waiters();
                });

                run_daemon_with_shutdown(cfg, opts, shutdown).await
            })
        })
        .context("spawn dropsync daemon thread")?;

    Ok(ThreadedDaemonHandle { shutdown: shutdown_tx, join: Some(join) })
}

pub fn start_threaded_from_config_path(config_path: &std::path::Path, overrides: ConfigOverrides, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let cfg = Config::load_with_overrides(config_path, overrides)?;
    start_threaded(cfg, opts)
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("logs").join("dropsync.log");
    }
    crate::config::default_log_file_path()
}

fn prepare_control_plane(cfg: &mut Config, control_addr: Option<String>, control_token_flag: Option<String>) -> Result<(String, String)> {
    let control_addr = control_addr
        .or_else(|| cfg.control_url.as_deref().and_then(control_url_to_addr))
        .unwrap_or_else(|| "127.0.0.1:17638".to_string());
    let control_addr = control_addr.trim().to_string();
    if control_addr.is_empty() {
        anyhow::bail!("control address is empty");
    }

    let token = control_token_flag
        .filter(|t| !t.trim().is_empty())
        .or_else(|| cfg.control_token.clone())
        .unwrap_or_default();
    let token = if token.trim().is_empty() { uuid::Uuid::new_v4().as_simple().to_string() } else { token };

    cfg.control_url = Some(format!("http://{control_addr}"));
    cfg.control_token = Some(token.clone());

    Ok((control_addr, token))
}

fn control_url_to_addr(control_url: &str) -> Option<String> {
    let u = control_url.trim();
    if u.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(u).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().unwrap_or(17638);
    Some(format!("{host}:{port}"))
}
