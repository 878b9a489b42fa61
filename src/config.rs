use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::Whitelist;
use crate::capabilities::{builtin_specs, CapabilitySpec};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{HostContext, ProcessEnvironment};
use crate::util::atomic_write;

/// Overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "HOSTBRIDGE_CONFIG";

const DEFAULT_ENV_ALLOWLIST: &[&str] = &["HOME", "LANG", "PATH", "SHELL", "USER"];

/// Settings shared by both ends of the bridge.
///
/// ```json
/// {
///   "capabilities": [
///     { "name": "get-power-information", "args": { "type": "object" } },
///     { "name": "get-environment-variable" }
///   ],
///   "environment_allowlist": ["HOME", "LANG"],
///   "log_filter": "info",
///   "call_timeout_secs": 10
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Whitelist handed to the bridge. Entries without `args` accept any object.
    pub capabilities: Vec<CapabilitySpec>,
    /// Environment variables host handlers may read.
    pub environment_allowlist: Vec<String>,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub call_timeout_secs: Option<u64>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capabilities: builtin_specs(),
            environment_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            log_filter: "info".to_string(),
            call_timeout_secs: Some(10),
            path: None,
        }
    }
}

impl BridgeConfig {
    /// `$HOSTBRIDGE_CONFIG`, else `<config dir>/hostbridge/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("hostbridge").join("config.json"))
    }

    /// Load from `path`. A missing file yields the defaults, remembered against `path`
    /// so a later `save` creates it.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<BridgeConfig>(&data).map_err(|e| {
                BridgeError::Config(format!("{}: {}", path.display(), e))
            })?
        } else {
            BridgeConfig::default()
        };
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn load_default() -> BridgeResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                log::warn!("No config directory on this platform, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> BridgeResult<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| BridgeError::Config("config has no backing file".into()))?;
        let data = serde_json::to_string_pretty(self)?;
        atomic_write(path, data.as_bytes())?;
        Ok(())
    }

    pub fn whitelist(&self) -> BridgeResult<Whitelist> {
        Whitelist::new(self.capabilities.iter().cloned())
    }

    /// Host context backed by the real machine, with environment access limited to
    /// the allowlist.
    pub fn host_context(&self) -> HostContext {
        HostContext::builder()
            .environment(ProcessEnvironment::new(self.environment_allowlist.iter().cloned()))
            .build()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{GET_ENVIRONMENT_VARIABLE, GET_PLATFORM};

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.capabilities, builtin_specs());
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.path(), Some(path.as_path()));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "capabilities": [ { "name": "get-platform" } ], "log_filter": "debug" }"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.environment_allowlist.len(), DEFAULT_ENV_ALLOWLIST.len());

        let whitelist = config.whitelist().unwrap();
        assert!(whitelist.contains(GET_PLATFORM));
        assert!(!whitelist.contains(GET_ENVIRONMENT_VARIABLE));
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = BridgeConfig::load(&path).unwrap();
        config.call_timeout_secs = None;
        config.environment_allowlist = vec!["LANG".into()];
        config.save().unwrap();

        let reloaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(reloaded.call_timeout_secs, None);
        assert_eq!(reloaded.environment_allowlist, vec!["LANG".to_string()]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            BridgeConfig::load(&path),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn save_without_path_fails() {
        assert!(BridgeConfig::default().save().is_err());
    }
}
