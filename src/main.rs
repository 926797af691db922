mod auth;
mod config;
mod control;
mod daemon;
mod engine;
mod errors;
mod filters;
mod hasher;
mod index;
mod logging;
mod pathmap;
mod remote;
mod state;
mod watcher;
mod workspace;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{Config, ConfigOverrides};

#[derive(Parser, Debug)]
#[command(name = "dropsync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Dropbox account email override
    #[arg(long = "email")]
    email: Option<String>,

    /// Sync root override
    #[arg(long = "dropbox-path")]
    dropbox_path: Option<PathBuf>,

    /// API server URL override
    #[arg(long = "server")]
    server: Option<String>,

    /// Control plane URL override
    #[arg(long = "control-url")]
    control_url: Option<String>,

    /// Control plane token override
    #[arg(long = "control-token")]
    control_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon
    Daemon {
        /// Address to bind the local control plane http server
        #[arg(short = 'a', long = "control-addr", default_value = "127.0.0.1:17638")]
        control_addr: String,

        /// Bearer token for the local control plane http server
        #[arg(short = 't', long = "control-token", default_value = "")]
        control_token: String,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// Continuously poll the local control plane /v1/status
    WatchStatus {
        /// Poll interval (e.g. 1s, 250ms)
        #[arg(long = "interval", default_value = "1s")]
        interval: String,

        /// Print raw json without pretty formatting
        #[arg(long = "raw", default_value_t = false)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, email, dropbox_path, server, control_url, control_token, command } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::WatchStatus { interval, raw }) => {
            run_watch_status(interval, raw, control_url, control_token, resolved_config).await
        }
        Some(Commands::Daemon { control_addr, control_token: token_flag }) => {
            let overrides = ConfigOverrides { email, dropbox_path, server_url: server, control_url, control_token };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, control_addr, token_flag).await
        }
        None => {
            let overrides = ConfigOverrides { email, dropbox_path, server_url: server, control_url, control_token };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            let control_addr = cfg.control_url.as_deref().and_then(control_url_to_addr).unwrap_or_else(|| "127.0.0.1:17638".to_string());
            run_daemon(cfg, control_addr, String::new()).await
        }
    }
}

async fn run_daemon(cfg: Config, control_addr: String, control_token: String) -> Result<()> {
    let opts = daemon::DaemonOptions {
        control_url: Some(control_addr),
        control_token: if control_token.trim().is_empty() { None } else { Some(control_token) },
        log_path: None,
    };
    let shutdown = std::sync::Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });
    daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await
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

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("DROPSYNC_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("DROPSYNC_BUILD_DATE").unwrap_or("");
    format!("{} ({}; rust; {}/{}; {})", version, revision, std::env::consts::OS, std::env::consts::ARCH, build_date)
}

async fn run_watch_status(interval: String, raw: bool, control_url: Option<String>, control_token: Option<String>, config_path: PathBuf) -> Result<()> {
    let overrides = ConfigOverrides { email: None, dropbox_path: None, server_url: None, control_url, control_token };
    let cfg = Config::load_with_overrides(&config_path, overrides)?;
    let control_url = cfg.control_url.clone().unwrap_or_default();
    let control_token = cfg.control_token.clone().unwrap_or_default();
    if control_url.trim().is_empty() || control_token.trim().is_empty() {
        anyhow::bail!("control plane not configured; set --control-url/--control-token or DROPSYNC_CONTROL_URL/DROPSYNC_CONTROL_TOKEN");
    }

    let poll_every = parse_duration(&interval)?;
    let status_url = format!("{}/v1/status", control_url.trim_end_matches('/'));
    let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(5)).build()?;

    let mut ticker = tokio::time::interval(poll_every);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let resp = http
                    .get(&status_url)
                    .header("Authorization", format!("Bearer {control_token}"))
                    .send()
                    .await;
                let resp = match resp {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                let body = match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                if raw {
                    println!("{}", String::from_utf8_lossy(&body));
                    continue;
                }
                let parsed: serde_json::Value = match serde_json::from_slice(&body) {
                    Ok(v) => v,
                    Err(_) => {
                        println!("{}", String::from_utf8_lossy(&body));
                        continue;
                    }
                };
                println!("{}", serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string()));
            }
        }
    }
}

fn parse_duration(raw: &str) -> Result<std::time::Duration> {
    let s = raw.trim();
    if s.is_empty() {
        anyhow::bail!("invalid duration: empty");
    }
    let (num, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else {
        (s, "s")
    };
    let value: u64 = num.parse().map_err(|_| anyhow::anyhow!("invalid duration: {raw}"))?;
    Ok(match unit {
        "ms" => std::time::Duration::from_millis(value),
        _ => std::time::Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_cli_parses_flags() {
        let cli = Cli::try_parse_from(["dropsync", "-c", "config.json", "daemon", "-a", "127.0.0.1:17638", "-t", "token123"]).unwrap();
        match cli.command {
            Some(Commands::Daemon { control_addr, control_token }) => {
                assert_eq!(control_addr, "127.0.0.1:17638");
                assert_eq!(control_token, "token123");
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn watch_status_cli_parses_flags() {
        let cli = Cli::try_parse_from(["dropsync", "watch-status", "--interval", "250ms", "--raw"]).unwrap();
        match cli.command {
            Some(Commands::WatchStatus { interval, raw }) => {
                assert_eq!(interval, "250ms");
                assert!(raw);
            }
            _ => panic!("expected watch-status"),
        }
    }

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["dropsync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parse_duration_accepts_ms_and_s() {
        assert_eq!(parse_duration("250ms").unwrap(), std::time::Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), std::time::Duration::from_secs(2));
        assert_eq!(parse_duration("2").unwrap(), std::time::Duration::from_secs(2));
        assert!(parse_duration("").is_err());
    }
}
