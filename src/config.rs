use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ShotError};

const STATE_DIR: &str = ".shotbox";

pub struct LibraryPaths {
    pub root: PathBuf,
    pub save_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub trash_dir: PathBuf,
    pub thumbnail_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub config_path: PathBuf,
}

impl LibraryPaths {
    pub fn new() -> Result<Self> {
        let base = dirs::picture_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| ShotError::NotFound("pictures or home directory".into()))?
            .join("Screenshots");
        Ok(Self::from_base(base))
    }

    pub fn from_base(base: PathBuf) -> Self {
        let state = base.join(STATE_DIR);
        Self {
            save_dir: base.clone(),
            archive_dir: base.join("Archive"),
            trash_dir: state.join("trash"),
            thumbnail_dir: state.join("thumbnails"),
            catalog_path: state.join("catalog.json"),
            config_path: state.join("config.json"),
            root: base,
        }
    }

    /// Creates every directory the library writes into.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.save_dir,
            &self.archive_dir,
            &self.trash_dir,
            &self.thumbnail_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Tunables for one library. Every field falls back to its default when
/// missing from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LibraryConfig {
    pub scan_batch_size: usize,
    pub lifecycle_batch_size: usize,
    pub save_debounce_ms: u64,
    pub recovery_capacity: usize,
    pub recovery_retention_days: i64,
    /// How often a running library sweeps expired recovery entries.
    pub recovery_sweep_secs: u64,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub thumbnail_quality: u8,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 50,
            lifecycle_batch_size: 10,
            save_debounce_ms: 5000,
            recovery_capacity: 100,
            recovery_retention_days: 30,
            recovery_sweep_secs: 3600,
            thumbnail_width: 200,
            thumbnail_height: 200,
            thumbnail_quality: 80,
        }
    }
}

impl LibraryConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config: Self = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(ShotError::Io(e)),
        };
        config.recovery_retention()?;
        Ok(config)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    /// Retention window of the recovery cache. Out-of-range day counts are
    /// rejected rather than wrapped.
    pub fn recovery_retention(&self) -> Result<TimeDelta> {
        let days = self.recovery_retention_days;
        if days < 0 {
            return Err(ShotError::InvalidInput(format!(
                "recoveryRetentionDays must not be negative, got {days}"
            )));
        }
        TimeDelta::try_days(days).ok_or_else(|| {
            ShotError::InvalidInput(format!("recoveryRetentionDays out of range: {days}"))
        })
    }

    /// Never zero, so it is always usable as a timer period.
    pub fn recovery_sweep(&self) -> Duration {
        Duration::from_secs(self.recovery_sweep_secs.max(1))
    }
}
