//! Runtime settings of the `tinyca` binary.
//!
//! Settings come from an optional TOML file and are then overridden by the
//! environment:
//!
//! | Variable         | Effect                                           |
//! |------------------|--------------------------------------------------|
//! | `CONTAINER=true` | store in `/var/lib/tinyPKI`, work in `/var/tinyPKI` |
//! | `TINY_ROOT_PATH` | store in `<root>/store`, work in `<root>/work`   |
//! | `TINY_LOG`       | `debug`/`dev`, `info`, `warning` or `error`      |
//!
//! ```toml
//! root_path = "/srv/tinyca"
//! container = false
//! log_level = "info"
//! ```

use crate::authority_config::AuthorityConfig;
use crate::runner::AuthorityKind;
use crate::storage::FsArtifactStore;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{warn, Level};

pub const CONTAINER_STORE_PATH: &str = "/var/lib/tinyPKI";
pub const CONTAINER_WORK_PATH: &str = "/var/tinyPKI";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding `store/` and `work/`.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
    #[serde(default)]
    pub container: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_path: None,
            container: false,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Directory of the running executable, `.` if unknown.
fn default_root_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_toml(&settings_str)
    }

    pub fn from_toml(settings_str: &str) -> Result<Self> {
        toml::from_str(settings_str).context("Failed to parse settings file")
    }

    /// Settings from `path` (or defaults), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(container) = lookup("CONTAINER") {
            self.container = container.eq_ignore_ascii_case("true");
        }
        if let Some(root_path) = lookup("TINY_ROOT_PATH") {
            self.root_path = Some(PathBuf::from(root_path));
        }
        if let Some(log_level) = lookup("TINY_LOG") {
            self.log_level = log_level;
        }
    }

    /// Store and work directories.
    ///
    /// A configured root path that does not exist falls back to the
    /// default location with a warning.
    pub fn paths(&self) -> (PathBuf, PathBuf) {
        let root = match &self.root_path {
            Some(root) if root.is_dir() => Some(root.clone()),
            Some(root) => {
                warn!(
                    "Root path {} not accessible, falling back to default",
                    root.display()
                );
                None
            }
            None => None,
        };

        match root {
            Some(root) => (root.join("store"), root.join("work")),
            None if self.container => (
                PathBuf::from(CONTAINER_STORE_PATH),
                PathBuf::from(CONTAINER_WORK_PATH),
            ),
            None => {
                let root = default_root_path();
                (root.join("store"), root.join("work"))
            }
        }
    }

    pub fn store(&self) -> FsArtifactStore {
        let (store, work) = self.paths();
        FsArtifactStore::new(store, work)
    }

    /// Log level; unknown names fall back to info.
    pub fn level(&self) -> Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" | "dev" => Level::DEBUG,
            "info" => Level::INFO,
            "warning" | "warn" => Level::WARN,
            "error" => Level::ERROR,
            other => {
                warn!("Log level `{}` ignored, using info", other);
                Level::INFO
            }
        }
    }
}

/// File name of the setup identity for `kind` in the work directory.
pub fn setup_file_name(kind: AuthorityKind) -> &'static str {
    match kind {
        AuthorityKind::Root => "root.config.json",
        AuthorityKind::Subordinate => "sub.config.json",
    }
}

/// Setup identity from `<work>/root.config.json` or `<work>/sub.config.json`,
/// if present.
pub fn read_setup_config(work: &Path, kind: AuthorityKind) -> Result<Option<AuthorityConfig>> {
    let path = work.join(setup_file_name(kind));
    if !path.is_file() {
        return Ok(None);
    }
    let data = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config = AuthorityConfig::from_json(&data)
        .with_context(|| format!("Invalid setup identity in {}", path.display()))?;
    Ok(Some(config))
}
