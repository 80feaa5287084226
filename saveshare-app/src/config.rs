use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Defensive bound: `config.json` is expected to be tiny.
///
/// This prevents pathological reads if the file is corrupted or replaced.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub fwl_path: String,
    #[serde(default)]
    pub file_tag: String,
    #[serde(default = "default_save_local_copy")]
    pub save_local_copy: bool,
    #[serde(default)]
    pub download_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            fwl_path: String::new(),
            file_tag: String::new(),
            save_local_copy: true,
            download_dir: String::new(),
        }
    }
}

fn default_save_local_copy() -> bool {
    true
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigSaveError {
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for ConfigSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            ConfigSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            ConfigSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigSaveError::Serialize(e) => Some(e),
            ConfigSaveError::WriteTmp(e) => Some(e),
            ConfigSaveError::Rename(e) => Some(e),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SAVESHARE_CONFIG_DIR") {
        let dir = PathBuf::from(override_dir);
        let _ = fs::create_dir_all(&dir);
        return dir.join("config.json");
    }

    let base = std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("ValheimSaveShare");
    let _ = fs::create_dir_all(&dir);
    dir.join("config.json")
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    let mut config: AppConfig = serde_json::from_str(&data).map_err(ConfigLoadError::Parse)?;
    reset_missing_paths(&mut config);
    Ok(config)
}

/// Remembered paths that no longer exist are cleared rather than surfaced;
/// the user just sees an empty field again.
fn reset_missing_paths(config: &mut AppConfig) {
    for field in [&mut config.db_path, &mut config.fwl_path] {
        if !field.is_empty() && !Path::new(field.as_str()).is_file() {
            field.clear();
        }
    }
    if !config.download_dir.is_empty() && !Path::new(&config.download_dir).is_dir() {
        config.download_dir.clear();
    }
}

pub fn load_config() -> AppConfig {
    let path = config_path();
    match load_config_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            let missing = matches!(
                &err,
                ConfigLoadError::Metadata(io_err) if io_err.kind() == io::ErrorKind::NotFound
            );
            if !missing {
                warn!("config load failed, using defaults: {err}");
            }
            AppConfig::default()
        }
    }
}

pub fn save_config_to_path(path: &Path, config: &AppConfig) -> Result<(), ConfigSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

/// Best-effort save: a failed write is logged and never blocks the share or
/// download flow.
pub fn save_config(config: &AppConfig) {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let path = config_path();

    for attempt in 1..=MAX_ATTEMPTS {
        match save_config_to_path(&path, config) {
            Ok(()) => return,
            Err(err) => {
                if attempt >= MAX_ATTEMPTS {
                    warn!("config save failed after {MAX_ATTEMPTS} attempts: {err}");
                    return;
                }
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
        }
    }
}
