use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use divevault_core::VaultConfig;

/// Load the vault configuration from a TOML file, applying a storage root override
pub fn load_config(path: &Path, root_override: Option<&PathBuf>) -> Result<VaultConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    let mut config: VaultConfig =
        toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))?;
    if let Some(root) = root_override {
        config.storage_root = root.clone();
    }
    config
        .validate()
        .with_context(|| format!("invalid configuration in {path:?}"))?;
    Ok(config)
}
