//! Layered configuration: CLI flag > environment variable > config file >
//! default, following the same precedence chain and `absolutize_path`/
//! `expand_tilde` path handling as the host's `config.rs`, retargeted from
//! SyftBox's data-dir/client-url settings to this engine's dropbox-path and
//! control-plane settings (§10.3, §6.1).

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    dropbox_path: Option<PathBuf>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    control_url: Option<String>,
    #[serde(default)]
    control_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[allow(dead_code)]
pub struct Config {
    pub dropbox_path: PathBuf,
    pub email: String,
    pub server_url: String,
    #[serde(default)]
    pub control_url: Option<String>,
    #[serde(default)]
    pub control_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub dropbox_path: Option<PathBuf>,
    pub email: Option<String>,
    pub server_url: Option<String>,
    pub control_url: Option<String>,
    pub control_token: Option<String>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".dropsync").join("logs").join("dropsync.log")
}

impl Config {
    pub fn default_dropbox_path() -> PathBuf {
        home_dir().join("Dropbox")
    }

    pub fn default_server_url() -> &'static str {
        "https://api.dropboxapi.com"
    }

    pub fn default_control_url() -> &'static str {
        "http://127.0.0.1:17638"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".dropsync").join("config.json")
    }

    /// The database and state directory living alongside `config_path`,
    /// holding `index.db` and `state.ini` (§6.1).
    pub fn state_dir(&self) -> PathBuf {
        self.config_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home_dir().join(".dropsync"))
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("DROPSYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir().join(".config").join("dropsync").join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_file_only(path: &Path) -> Result<Self> {
        let file_cfg = read_file_cfg(path)?;
        Self::from_parts(path, file_cfg, PartialConfig::default(), ConfigOverrides::default())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = read_file_cfg(path)?;
        let env_cfg = read_env_config();
        Self::from_parts(path, file_cfg, env_cfg, overrides)
    }

    fn from_parts(
        path: &Path,
        file_cfg: PartialConfig,
        env_cfg: PartialConfig,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let dropbox_path = overrides
            .dropbox_path
            .or(env_cfg.dropbox_path)
            .or(file_cfg.dropbox_path)
            .unwrap_or_else(Self::default_dropbox_path);
        let email = overrides
            .email
            .or(env_cfg.email)
            .or(file_cfg.email)
            .unwrap_or_default();
        let server_url = overrides
            .server_url
            .or(env_cfg.server_url)
            .or(file_cfg.server_url)
            .unwrap_or_else(|| Self::default_server_url().to_string());
        let control_url = overrides
            .control_url
            .or(env_cfg.control_url)
            .or(file_cfg.control_url)
            .or_else(|| Some(Self::default_control_url().to_string()));
        let control_token = overrides
            .control_token
            .or(env_cfg.control_token)
            .or(file_cfg.control_token);
        let refresh_token = env_cfg.refresh_token.or(file_cfg.refresh_token);
        let access_token = env_cfg.access_token.or(file_cfg.access_token);

        let mut cfg = Config {
            dropbox_path,
            email,
            server_url,
            control_url,
            control_token,
            refresh_token,
            access_token,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn new_for_save(
        path: &Path,
        dropbox_path: &Path,
        email: &str,
        server_url: &str,
        control_url: Option<String>,
        control_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Result<Self> {
        let mut cfg = Config {
            dropbox_path: dropbox_path.to_path_buf(),
            email: email.to_string(),
            server_url: server_url.to_string(),
            control_url,
            control_token,
            refresh_token,
            access_token: None,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }

    fn normalize(&mut self) -> Result<()> {
        self.email = self.email.to_lowercase();
        self.dropbox_path = absolutize_path(&self.dropbox_path);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_email(&self.email)?;
        validate_url(&self.server_url).context("server_url")?;
        if let Some(url) = &self.control_url {
            validate_url(url).context("control_url")?;
        }
        Ok(())
    }
}

fn read_file_cfg(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    let data = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str::<PartialConfig>(&data).context("parse config json")
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    dropbox_path: &'a PathBuf,
    email: &'a str,
    server_url: &'a str,
    #[serde(skip_serializing_if = "is_none_or_empty")]
    control_url: &'a Option<String>,
    #[serde(skip_serializing_if = "is_none_or_empty")]
    control_token: &'a Option<String>,
    #[serde(skip_serializing_if = "is_none_or_empty")]
    refresh_token: &'a Option<String>,
}

fn is_none_or_empty(v: &Option<String>) -> bool {
    v.as_deref().unwrap_or("").trim().is_empty()
}

fn save_config_file(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let persisted = PersistedConfig {
        dropbox_path: &cfg.dropbox_path,
        email: &cfg.email,
        server_url: &cfg.server_url,
        control_url: &cfg.control_url,
        control_token: &cfg.control_token,
        refresh_token: &cfg.refresh_token,
    };
    let data = serde_json::to_vec(&persisted).context("serialize config")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[allow(dead_code)]
pub fn save_refresh_token_file_only(path: &Path, refresh_token: &str) -> Result<()> {
    let mut cfg = Config::load_file_only(path)?;
    cfg.refresh_token = Some(refresh_token.to_string());
    cfg.save()
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap());
    if PATTERN.is_match(email) {
        Ok(())
    } else {
        anyhow::bail!("invalid email: {email}")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("DROPSYNC_EMAIL") {
        let v = v.trim();
        if !v.is_empty() {
            out.email = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_DROPBOX_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            out.dropbox_path = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_SERVER_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.server_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_CONTROL_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.control_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_CONTROL_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.control_token = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_REFRESH_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.refresh_token = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("DROPSYNC_ACCESS_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.access_token = Some(v.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> = once_cell::sync::Lazy::new(|| Mutex::new(()));

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn env_keys() -> &'static [&'static str] {
        &[
            "DROPSYNC_EMAIL",
            "DROPSYNC_DROPBOX_PATH",
            "DROPSYNC_SERVER_URL",
            "DROPSYNC_CONTROL_URL",
            "DROPSYNC_CONTROL_TOKEN",
            "DROPSYNC_CONFIG_PATH",
        ]
    }

    #[test]
    fn load_config_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("dropsync-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let dropbox_path = tmp.join("data").display().to_string().replace('\\', "/");
        let json = format!(
            r#"{{
                "email": "Alice@Example.com",
                "dropbox_path": "{}",
                "server_url": "http://127.0.0.1:8080",
                "control_url": "http://127.0.0.1:17638"
            }}"#,
            dropbox_path
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email, "alice@example.com");
        assert_eq!(cfg.server_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.control_url.as_deref(), Some("http://127.0.0.1:17638"));
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
        assert!(cfg.dropbox_path.is_absolute());
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("dropsync-config-test-bad-url");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "email": "alice@example.com",
            "dropbox_path": "/tmp/data",
            "server_url": "ftp://bad.example.com"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }

    #[test]
    fn reject_invalid_email() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("dropsync-config-test-bad-email");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "email": "not-an-email",
            "dropbox_path": "/tmp/data",
            "server_url": "http://localhost:8080"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid email"));
    }

    #[test]
    fn load_with_overrides_flag_beats_env_beats_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());

        let tmp = env::temp_dir().join("dropsync-config-precedence");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let file_dropbox_path = tmp.join("file-data");
        let env_dropbox_path = tmp.join("env-data");
        let flag_dropbox_path = tmp.join("flag-data");

        let cfg_path = tmp.join("config.json");
        let file_dropbox_path_str = file_dropbox_path.display().to_string().replace('\\', "/");
        fs::write(
            &cfg_path,
            format!(
                r#"{{
              "email": "file@example.com",
              "dropbox_path": "{}",
              "server_url": "https://file.example.com",
              "control_url": "http://file.local:1234",
              "control_token": "file-token"
            }}"#,
                file_dropbox_path_str
            ),
        )
        .unwrap();

        env::set_var("DROPSYNC_EMAIL", "env@example.com");
        env::set_var("DROPSYNC_DROPBOX_PATH", env_dropbox_path.to_string_lossy().as_ref());
        env::set_var("DROPSYNC_SERVER_URL", "https://env.example.com");
        env::set_var("DROPSYNC_CONTROL_URL", "http://env.local:5555");
        env::set_var("DROPSYNC_CONTROL_TOKEN", "env-token");

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email, "env@example.com");
        assert_eq!(cfg.dropbox_path, env_dropbox_path);
        assert_eq!(cfg.server_url, "https://env.example.com");

        let overrides = ConfigOverrides {
            email: Some("flag@example.com".to_string()),
            dropbox_path: Some(flag_dropbox_path.clone()),
            server_url: Some("https://flag.example.com".to_string()),
            control_url: Some("http://flag.local:9999".to_string()),
            control_token: Some("flag-token".to_string()),
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.email, "flag@example.com");
        assert_eq!(cfg.dropbox_path, flag_dropbox_path);
        assert_eq!(cfg.server_url, "https://flag.example.com");
    }

    #[test]
    fn save_refresh_token_overwrites_file_and_omits_access_token() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("dropsync-save-refresh-token");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{
              "email":"alice@example.com",
              "dropbox_path":"/tmp/dropbox",
              "server_url":"https://api.dropboxapi.com",
              "control_url":"http://localhost:17638",
              "refresh_token":"old",
              "access_token":"SHOULD_NOT_PERSIST"
            }"#,
        )
        .unwrap();

        save_refresh_token_file_only(&cfg_path, "new").unwrap();

        let raw = fs::read_to_string(&cfg_path).unwrap();
        assert!(raw.contains("\"refresh_token\":\"new\""));
        assert!(!raw.contains("access_token"));
    }

    #[test]
    fn default_log_file_path_matches_dotted_convention() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(&["HOME"]);

        let tmp = env::temp_dir().join("dropsync-log-path-home");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        env::set_var("HOME", &tmp);

        let p = default_log_file_path();
        assert!(p.ends_with(".dropsync/logs/dropsync.log"));
        assert!(p.to_string_lossy().contains(tmp.to_string_lossy().as_ref()));
    }
}
