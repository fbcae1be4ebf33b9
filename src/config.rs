#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "./tmp";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOADER: &str = "yt-dlp";

/// Subdirectory of the downloads root where finished videos land; the
/// downloader runs with this as its working directory.
pub const VIDEOS_SUBDIR: &str = "videos";

/// SQLite database file relative to the downloads root.
pub const METADATA_DB_FILE: &str = "videos.db";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub downloads_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub downloader: PathBuf,
}

impl RuntimePaths {
    pub fn videos_dir(&self) -> PathBuf {
        self.downloads_root.join(VIDEOS_SUBDIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.downloads_root.join(METADATA_DB_FILE)
    }
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    resolve_runtime_paths(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub downloader: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_paths(&file_vars, env_var_string, overrides))
}

fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let downloads_root = overrides
        .downloads_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOADS_DIR", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOADS_DIR.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEVAULT_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEVAULT_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let downloader = overrides
        .downloader
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEVAULT_YTDLP", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOADER.to_string());

    RuntimePaths {
        downloads_root: PathBuf::from(downloads_root),
        port,
        host,
        downloader: PathBuf::from(downloader),
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
