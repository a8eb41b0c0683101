//! Bridge configuration.
//!
//! Values are layered: built-in defaults, then the JSON config file, then
//! environment variables.
//!
//! The config file is `{ "unity": { ... } }` with camelCase keys and is found
//! at, in order:
//! 1. `$UNITY_BRIDGE_CONFIG`
//! 2. `./.unity/config.json`
//! 3. `~/.unity/config.json`

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_PATH_ENV: &str = "UNITY_BRIDGE_CONFIG";

/// What to do when the editor package version differs from the bridge's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Skip the check.
    Off,
    /// Log a warning and carry on.
    #[default]
    Warn,
    /// Fail every later command.
    Error,
}

impl FromStr for VersionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(VersionPolicy::Off),
            "warn" => Ok(VersionPolicy::Warn),
            "error" => Ok(VersionPolicy::Error),
            other => Err(anyhow!(
                "Unknown version mismatch policy '{}' (expected off, warn or error)",
                other
            )),
        }
    }
}

/// Connection settings for the editor command channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Host the editor listens on. `mcpHost` is accepted for older files.
    #[serde(alias = "mcpHost")]
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Default per-command deadline.
    pub command_timeout_ms: u64,
    /// First background reconnect delay; grows by the multiplier.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub reconnect_backoff_multiplier: f64,
    pub auto_reconnect: bool,
    pub version_mismatch: VersionPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6400,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            reconnect_backoff_multiplier: 2.0,
            auto_reconnect: true,
            version_mismatch: VersionPolicy::Warn,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    unity: Option<BridgeConfig>,
}

impl BridgeConfig {
    /// Load defaults, the config file (if any) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match find_config_file() {
            Some(path) => {
                tracing::info!("Using config file: {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read the `unity` section of a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(file.unity.unwrap_or_default())
    }

    /// Override fields from environment variables, looked up via `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("UNITY_BRIDGE_HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = parse_env(&lookup, "UNITY_BRIDGE_PORT")? {
            self.port = port;
        }
        if let Some(ms) = parse_env(&lookup, "UNITY_BRIDGE_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = parse_env(&lookup, "UNITY_BRIDGE_COMMAND_TIMEOUT_MS")? {
            self.command_timeout_ms = ms;
        }
        if let Some(ms) = parse_env(&lookup, "UNITY_BRIDGE_RECONNECT_DELAY_MS")? {
            self.reconnect_delay_ms = ms;
        }
        if let Some(enabled) = parse_env(&lookup, "UNITY_BRIDGE_AUTO_RECONNECT")? {
            self.auto_reconnect = enabled;
        }
        if let Some(policy) = parse_env(&lookup, "UNITY_BRIDGE_VERSION_MISMATCH")? {
            self.version_mismatch = policy;
        }
        Ok(())
    }

    /// `host:port` of the editor listener.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Delay before background reconnect attempt number `attempt` (0-based):
    /// `reconnect_delay * multiplier^attempt`, capped at the maximum.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .reconnect_backoff_multiplier
            .max(1.0)
            .powi(attempt.min(32) as i32);
        let ms = (self.reconnect_delay_ms as f64 * factor).min(self.max_reconnect_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        _ => Ok(None),
    }
}

/// Locate the config file, if one exists.
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }

    let local = PathBuf::from(".unity").join("config.json");
    if local.exists() {
        return Some(local);
    }

    dirs::home_dir()
        .map(|home| home.join(".unity").join("config.json"))
        .filter(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.endpoint(), "localhost:6400");
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert_eq!(config.max_reconnect_delay_ms, 30000);
        assert!(config.auto_reconnect);
        assert_eq!(config.version_mismatch, VersionPolicy::Warn);
    }

    #[test]
    fn test_reconnect_backoff_grows_and_caps() {
        let config = BridgeConfig::default();
        let delays: Vec<u64> = (0..7)
            .map(|attempt| config.reconnect_backoff(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(config.reconnect_backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_from_file_with_legacy_host_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"unity": {"mcpHost": "host.docker.internal", "port": 6410, "versionMismatch": "error"}}"#,
        )
        .unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();

        assert_eq!(config.host, "host.docker.internal");
        assert_eq!(config.port, 6410);
        assert_eq!(config.version_mismatch, VersionPolicy::Error);
        assert_eq!(config.command_timeout_ms, 30000);
    }

    #[test]
    fn test_from_file_without_unity_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"project": {}}"#).unwrap();

        assert_eq!(BridgeConfig::from_file(&path).unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_from_file_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = BridgeConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .apply_env(env(&[
                ("UNITY_BRIDGE_HOST", " 10.0.0.5 "),
                ("UNITY_BRIDGE_PORT", "7000"),
                ("UNITY_BRIDGE_COMMAND_TIMEOUT_MS", "1500"),
                ("UNITY_BRIDGE_AUTO_RECONNECT", "false"),
                ("UNITY_BRIDGE_VERSION_MISMATCH", "OFF"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint(), "10.0.0.5:7000");
        assert_eq!(config.command_timeout_ms, 1500);
        assert!(!config.auto_reconnect);
        assert_eq!(config.version_mismatch, VersionPolicy::Off);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env(env(&[("UNITY_BRIDGE_PORT", "not-a-port")]))
            .unwrap_err();

        assert!(err.to_string().contains("UNITY_BRIDGE_PORT"), "got: {}", err);
        assert_eq!(config.port, 6400);
    }

    #[test]
    fn test_version_policy_parse() {
        assert_eq!("warn".parse::<VersionPolicy>().unwrap(), VersionPolicy::Warn);
        assert_eq!(" Error ".parse::<VersionPolicy>().unwrap(), VersionPolicy::Error);
        assert!("loud".parse::<VersionPolicy>().is_err());
    }
}
