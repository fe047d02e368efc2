use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pile::PileOptions;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HaystackConfig {
    pub connection: Option<String>,
    pub clone_dir: Option<PathBuf>,
    pub pool_size: Option<u32>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("haystack.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<HaystackConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: HaystackConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

impl HaystackConfig {
    /// Fill unset fields from `fallback`; values already set here win.
    pub fn or(self, fallback: HaystackConfig) -> HaystackConfig {
        HaystackConfig {
            connection: self.connection.or(fallback.connection),
            clone_dir: self.clone_dir.or(fallback.clone_dir),
            pool_size: self.pool_size.or(fallback.pool_size),
        }
    }

    pub fn to_options(&self) -> PileOptions {
        let mut options = PileOptions::new();
        if let Some(connection) = &self.connection {
            options = options.connection(connection.clone());
        }
        if let Some(dir) = &self.clone_dir {
            options = options.clone_dir(dir.clone());
        }
        if let Some(size) = self.pool_size {
            options = options.pool_size(size);
        }
        options
    }
}
