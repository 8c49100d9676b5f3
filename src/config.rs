//! Engine configuration and its on-disk location.
//!
//! Every field has a default, so a partial JSON file (or none at all) is fine.
//!
//! Config directory priority:
//! 1. `--config <FILE>` on the command line (handled by the caller)
//! 2. `PLAYTREE_CONFIG_DIR` environment variable
//! 3. Platform config directory from dirs-next (`~/.config/playtree` on Linux)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::Workers;

pub const CONFIG_FILE: &str = "playtree.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads, 0 = auto
    pub workers: usize,
    /// Fraction of available memory the frame cache may use (0.0-1.0)
    pub cache_mem_fraction: f64,
    /// Memory kept free for the system (GB)
    pub cache_reserve_gb: f64,
    /// Max frames held by the global cache
    pub cache_capacity: usize,
    pub caching_enabled: bool,
    /// Failed reads of one frame before it is given up
    pub max_load_attempts: u32,
    pub default_frame_rate: f64,
    /// Seconds a static item is shown
    pub default_static_duration: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            cache_mem_fraction: 0.5,
            cache_reserve_gb: 2.0,
            cache_capacity: 10_000,
            caching_enabled: true,
            max_load_attempts: 3,
            default_frame_rate: 20.0,
            default_static_duration: 5.0,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Load `path`, or the default location if it exists, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        let default = default_path();
        if default.is_file() {
            return Self::load(&default);
        }
        debug!("No config file, using defaults");
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Worker thread count with "auto" resolved
    pub fn worker_threads(&self) -> usize {
        if self.workers == 0 { Workers::auto_threads() } else { self.workers }
    }
}

/// Directory for config files
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLAYTREE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("playtree");
    }
    PathBuf::from(".")
}

pub fn default_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}
