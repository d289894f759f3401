use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What a relay does when encryption for a single device fails.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncryptFailureMode {
    Abort,
    BestEffort,
}

impl Default for EncryptFailureMode {
    fn default() -> Self {
        EncryptFailureMode::Abort
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub device_cache_ttl_secs: u64,
    pub encrypt_failure_mode: EncryptFailureMode,
    pub attach_bot_marker: bool,
    pub send_read_receipts: bool,
    pub media_download_host: String,
    pub server_domain: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_cache_ttl_secs: 5 * 60,
            encrypt_failure_mode: EncryptFailureMode::Abort,
            attach_bot_marker: true,
            send_read_receipts: true,
            media_download_host: "mmg.whatsapp.net".to_string(),
            server_domain: "s.whatsapp.net".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: CoreConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.device_cache_ttl_secs == 0 {
            return Err(CoreError::Config("device_cache_ttl_secs".to_string()));
        }
        if self.media_download_host.trim().is_empty() {
            return Err(CoreError::Config("media_download_host".to_string()));
        }
        if self.server_domain.trim().is_empty() {
            return Err(CoreError::Config("server_domain".to_string()));
        }
        Ok(())
    }

    pub fn best_effort(&self) -> bool {
        matches!(self.encrypt_failure_mode, EncryptFailureMode::BestEffort)
    }
}
