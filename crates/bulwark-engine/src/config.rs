//! Engine configuration.
//!
//! Loaded from JSON; every field has a default so a partial file works.
//!
//! ```json
//! {
//!   "zone_radius": 40.0,
//!   "max_zone_radius": 100.0,
//!   "save_delay_secs": 300,
//!   "storage": { "root": "./bulwark", "retention_days": 7 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use bulwark_model::ZonePartitioner;
use bulwark_storage::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Padding added to every zone around its structural points.
    pub zone_radius: f32,
    /// Zones larger than this are split.
    pub max_zone_radius: f32,
    pub max_split_depth: u32,
    /// Minimum time between two saves of the same structure.
    pub save_delay_secs: u64,
    /// Automatic retries after a failed save before a record needs
    /// re-initialization.
    pub max_retries: u32,
    /// A pipeline yields once a slice has run longer than this.
    pub max_step_duration_ms: u64,
    /// How often the host is expected to call `tick`.
    pub tick_interval_ms: u64,
    /// Capture neighbouring tracked structures whose zones touch.
    pub link_structures: bool,
    pub exclude_unowned_collectibles: bool,
    /// Only capture objects owned by a user authorized on a linked structure.
    pub require_authorized_owner: bool,
    pub lease_secs: u64,
    pub storage: StorageConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            zone_radius: 40.0,
            max_zone_radius: 100.0,
            max_split_depth: ZonePartitioner::DEFAULT_MAX_DEPTH,
            save_delay_secs: 300,
            max_retries: 3,
            max_step_duration_ms: 20,
            tick_interval_ms: 1_000,
            link_structures: true,
            exclude_unowned_collectibles: true,
            require_authorized_owner: false,
            lease_secs: 120,
            storage: StorageConfig::default(),
        }
    }
}

impl BackupConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading `{}`: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.partitioner()?;
        if self.max_step_duration_ms == 0 {
            return Err(EngineError::Config(
                "max_step_duration_ms must be positive".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(EngineError::Config("tick_interval_ms must be positive".into()));
        }
        if self.lease_secs == 0 {
            return Err(EngineError::Config("lease_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn partitioner(&self) -> Result<ZonePartitioner> {
        ZonePartitioner::new(self.zone_radius, self.max_zone_radius)
            .map(|p| p.with_max_depth(self.max_split_depth))
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn save_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.save_delay_secs.min(u32::MAX as u64) as i64)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(u32::MAX as u64) as i64)
    }

    pub fn max_step_duration(&self) -> Duration {
        Duration::from_millis(self.max_step_duration_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
