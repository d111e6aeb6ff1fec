//! On-disk CLI settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use soundvault_vault::VaultConfig;

const CONFIG_FILE: &str = "soundvault.json";

/// Backend selection plus the vault core settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Registered backend name (`local`, `dropbox`).
    pub backend: String,
    /// Backend-specific options passed to the registry.
    #[serde(default)]
    pub backend_config: Value,
    #[serde(default)]
    pub vault: VaultConfig,
}

impl CliConfig {
    /// Local backend storing blobs under `data_dir/blobs`.
    pub fn local(data_dir: &Path) -> Self {
        Self {
            backend: "local".to_string(),
            backend_config: json!({ "root": data_dir.join("blobs") }),
            vault: VaultConfig::default(),
        }
    }

    /// Load the settings in `data_dir`, writing defaults on first use.
    pub fn load_or_init(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            let config = Self::local(data_dir);
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;
            std::fs::write(&path, serde_json::to_string_pretty(&config)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            return Ok(config);
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        config.vault.validate().context("Invalid vault settings")?;
        Ok(config)
    }

    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load_or_init(dir.path()).unwrap();
        assert_eq!(config.backend, "local");
        assert!(CliConfig::path(dir.path()).exists());

        let again = CliConfig::load_or_init(dir.path()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_partial_settings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            CliConfig::path(dir.path()),
            r#"{"backend": "dropbox", "backend_config": {"auth": {"app_key": "k"}}, "vault": {"chunk_size": 1048576}}"#,
        )
        .unwrap();

        let config = CliConfig::load_or_init(dir.path()).unwrap();
        assert_eq!(config.backend, "dropbox");
        assert_eq!(config.vault.chunk_size, 1024 * 1024);
        assert_eq!(config.vault.library_timeout_secs, 30);
    }

    #[test]
    fn test_rejects_invalid_vault_settings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            CliConfig::path(dir.path()),
            r#"{"backend": "local", "vault": {"chunk_size": 0}}"#,
        )
        .unwrap();
        assert!(CliConfig::load_or_init(dir.path()).is_err());
    }
}
