use crate::domain::{LaunchContext, TrainLogging};
use crate::infra::{AuditLog, SupervisorConfig, resolve_audit_log_path};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_ENV: &str = "TRAINBOX_SETTINGS";
pub const REPO_ROOT_ENV: &str = "TRAINBOX_REPO_ROOT";
pub const PYTHON_ENV: &str = "TRAINBOX_PYTHON";
pub const AUDIT_LOG_ENV: &str = "TRAINBOX_AUDIT_LOG";

const REPO_MARKERS: &[&str] = &["train.py", "train.sh"];
const REPO_SEARCH_DEPTH: usize = 4;

#[cfg(unix)]
const DEFAULT_PYTHON: &str = "python3";
#[cfg(not(unix))]
const DEFAULT_PYTHON: &str = "python";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    pub repo_root: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub mission: Option<String>,
    pub train_debug: bool,
    pub fight_report: bool,
    pub disable_train_logging: bool,
    pub cancel_grace_ms: u64,
    pub snapshot_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_root: None,
            python: None,
            audit_log: None,
            mission: None,
            train_debug: false,
            fight_report: false,
            disable_train_logging: false,
            cancel_grace_ms: 3_000,
            snapshot_interval_ms: 250,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveSettingsPathError {
    #[error("could not determine the config directory; set TRAINBOX_SETTINGS")]
    ConfigDirNotFound,
}

#[derive(Debug, Error)]
pub enum LoadSettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub fn resolve_settings_path() -> Result<PathBuf, ResolveSettingsPathError> {
    if let Some(path) = std::env::var_os(SETTINGS_ENV) {
        return Ok(PathBuf::from(path));
    }

    let Some(config) = config_dir() else {
        return Err(ResolveSettingsPathError::ConfigDirNotFound);
    };

    Ok(config.join("trainbox").join("settings.json"))
}

/// Reads settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, LoadSettingsError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(source) => {
            return Err(LoadSettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw).map_err(|source| LoadSettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Settings {
    /// Applies `TRAINBOX_REPO_ROOT`, `TRAINBOX_PYTHON` and `TRAINBOX_AUDIT_LOG` as read through
    /// `lookup`. Empty values are ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let path_var = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };
        if let Some(path) = path_var(REPO_ROOT_ENV) {
            self.repo_root = Some(path);
        }
        if let Some(path) = path_var(PYTHON_ENV) {
            self.python = Some(path);
        }
        if let Some(path) = path_var(AUDIT_LOG_ENV) {
            self.audit_log = Some(path);
        }
        self
    }

    pub fn launch_context(&self, cwd: &Path) -> LaunchContext {
        let repo_root = self
            .repo_root
            .clone()
            .or_else(|| find_repo_root(cwd))
            .unwrap_or_else(|| cwd.to_path_buf());
        let python = self
            .python
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PYTHON));
        LaunchContext::new(repo_root, python)
    }

    pub fn audit_log_path(&self, cwd: &Path) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| resolve_audit_log_path(cwd))
    }

    pub fn supervisor_config(&self, cwd: &Path) -> SupervisorConfig {
        SupervisorConfig {
            audit_log: Some(AuditLog::new(self.audit_log_path(cwd))),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
        }
    }

    pub fn train_logging(&self) -> TrainLogging {
        TrainLogging {
            speed_mode: self.disable_train_logging,
            train_debug: self.train_debug,
            fight_report: self.fight_report,
        }
    }
}

/// Looks for a training checkout at `start` and up to four parent directories.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .take(REPO_SEARCH_DEPTH + 1)
        .find(|dir| REPO_MARKERS.iter().any(|marker| dir.join(marker).is_file()))
        .map(Path::to_path_buf)
}
