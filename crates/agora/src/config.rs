//! Application configuration and on-disk paths.
//!
//! Layering, lowest first: built-in defaults, `config.toml`, then environment
//! variables with the `AGORA` prefix and `__` as the section separator
//! (`AGORA_SERVER__PORT=9000`).

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::TimeDelta;
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::ws::HubConfig;

pub const APP_NAME: &str = "agora";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub hub: HubConfig,
    pub sessions: SessionsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to call the API cross-origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `<data_dir>/agora.db`.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// How often expired sessions are purged.
    pub cleanup_interval_secs: u64,
    /// Lifetime of sessions issued from the CLI, e.g. `7d` or `12h`.
    pub default_ttl: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 3600,
            default_ttl: "7d".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.hub.validate().context("invalid hub configuration")?;
        if self.sessions.cleanup_interval_secs == 0 {
            bail!("sessions.cleanup_interval_secs must be greater than zero");
        }
        parse_duration(&self.sessions.default_ttl).context("invalid sessions.default_ttl")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }

    pub fn database_path(&self, cfg: &AppConfig) -> Result<PathBuf> {
        match cfg.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.data_dir.join(format!("{APP_NAME}.db"))),
        }
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

/// Load the layered configuration, writing a default file first if none exists.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }
    load_config(&paths.config_file, &env_prefix())
}

/// Build the configuration from `path` (if present) and `<prefix>_*` variables.
pub fn load_config(path: &Path, env_prefix: &str) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins")
                .try_parsing(true),
        )
        .build()
        .context("building configuration")?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Parse `30s`, `15m`, `12h`, `7d` or `2w`.
pub fn parse_duration(s: &str) -> Result<TimeDelta> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        bail!("empty duration string");
    };

    let num: i64 = s[..s.len() - unit.len_utf8()]
        .parse()
        .context("invalid duration number")?;
    if num <= 0 {
        bail!("duration must be positive");
    }

    let unit_seconds: i64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        'w' => 604800,
        _ => bail!("invalid duration unit '{}', use s/m/h/d/w", unit),
    };

    num.checked_mul(unit_seconds)
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| anyhow!("duration out of range: {s}"))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn xdg_dir(var: &str, fallback: Option<PathBuf>, home_rel: &[&str]) -> Result<PathBuf> {
    if let Some(dir) = env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = fallback {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home_rel.iter().fold(home, |p, part| p.join(part)).join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine {var} directory"))
}

fn default_config_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), &[".config"])
}

fn default_data_dir() -> Result<PathBuf> {
    xdg_dir("XDG_DATA_HOME", dirs::data_dir(), &[".local", "share"])
}

fn default_state_dir() -> Result<PathBuf> {
    xdg_dir("XDG_STATE_HOME", dirs::state_dir(), &[".local", "state"])
}

/// `AGORA` for the default app name.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
