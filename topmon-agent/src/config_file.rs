use anyhow::{Context, Result};
use std::path::PathBuf;
use topmon_core::{ConfigSource, MonitorConfig};

/// Monitor configuration persisted as a JSON map of id to spec.
/// A missing file means an empty configuration, not an error.
pub struct JsonFileConfig {
    path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigSource for JsonFileConfig {
    fn load(&self) -> Result<MonitorConfig> {
        if !self.path.exists() {
            return Ok(MonitorConfig::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))
    }

    fn store(&self, config: &MonitorConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
