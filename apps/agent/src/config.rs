//! Agent configuration management.
//!
//! Configuration is stored as TOML at `~/.config/datamover/agent.toml`,
//! or wherever `DATAMOVER_CONFIG` points.

use std::path::{Path, PathBuf};

use datamover_hierarchy::HierarchyOptions;
use datamover_transfer::TransferOptions;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration path.
const CONFIG_ENV: &str = "DATAMOVER_CONFIG";

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory tree to copy from.
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Directory the tree is mirrored into.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Where the resume journal is kept.
    #[serde(default = "default_journal")]
    pub journal: PathBuf,

    #[serde(default)]
    pub transfer: TransferOptions,

    #[serde(default)]
    pub hierarchy: HierarchyOptions,
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn default_source() -> PathBuf {
    home().join("datamover").join("outbox")
}

fn default_destination() -> PathBuf {
    home().join("datamover").join("inbox")
}

fn default_journal() -> PathBuf {
    home()
        .join(".local")
        .join("state")
        .join("datamover")
        .join("journal.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source(),
            destination: default_destination(),
            journal: default_journal(),
            transfer: TransferOptions::default(),
            hierarchy: HierarchyOptions::default(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    home().join(".config").join("datamover").join("agent.toml")
}
