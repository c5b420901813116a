use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// Reserved property namespace holding runtime settings of an extension.
pub const GRAPH_NAMESPACE: &str = "_graph";

pub const DEFAULT_PATH_TIMEOUT_US: u64 = 5 * 60 * 1_000_000;
pub const DEFAULT_PATH_CHECK_INTERVAL_US: u64 = 10 * 1_000_000;
const SAFETY_MARGIN_US: u64 = 1_000_000;

pub const ENV_IN_PATH_TIMEOUT: &str = "PATH_TIMEOUT_IN_US";
pub const ENV_OUT_PATH_TIMEOUT: &str = "PATH_TIMEOUT_OUT_US";
pub const ENV_PATH_CHECK_INTERVAL: &str = "PATH_CHECK_INTERVAL_US";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;

    async fn get_u64(&self, key: &str) -> Option<u64> {
        let raw = self.get(key).await?;
        match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, value = %raw, "ignoring non numeric setting: {e}");
                None
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Settings read from the process environment, optionally seeded from a
/// `.env` file. Writes go to both.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        }
        Box::new(Self { env_file })
    }

    fn rewrite_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| line.split_once('=').is_none_or(|(k, _)| k.trim() != key))
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_file(key, Some(value)).map_err(|e| e.to_string())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            let _ = self.rewrite_file(key, None);
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Lifetimes of IN/OUT paths and the sweep period of the path timers, all
/// in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PathTimeoutInfo {
    pub in_path_timeout_us: u64,
    pub out_path_timeout_us: u64,
    pub check_interval_us: u64,
}

impl Default for PathTimeoutInfo {
    fn default() -> Self {
        Self {
            in_path_timeout_us: DEFAULT_PATH_TIMEOUT_US,
            out_path_timeout_us: DEFAULT_PATH_TIMEOUT_US,
            check_interval_us: DEFAULT_PATH_CHECK_INTERVAL_US,
        }
    }
}

fn positive_u64(v: &Value) -> Option<u64> {
    v.as_u64().filter(|v| *v > 0)
}

impl PathTimeoutInfo {
    /// Paths owned by the engine never expire.
    pub fn never() -> Self {
        Self {
            in_path_timeout_us: u64::MAX,
            out_path_timeout_us: u64::MAX,
            check_interval_us: DEFAULT_PATH_CHECK_INTERVAL_US,
        }
    }

    /// Overlay the `_graph` namespace of an extension's properties.
    ///
    /// `path_timeout` is either `{"in_path": .., "out_path": ..}` or a bare
    /// integer, which only sets the OUT timeout. Zero or non-numeric values
    /// leave the current setting untouched.
    pub fn with_properties(mut self, properties: &Value) -> Self {
        let Some(ns) = properties.get(GRAPH_NAMESPACE) else {
            return self;
        };
        match ns.get("path_timeout") {
            Some(Value::Object(timeouts)) => {
                if let Some(v) = timeouts.get("in_path").and_then(positive_u64) {
                    self.in_path_timeout_us = v;
                }
                if let Some(v) = timeouts.get("out_path").and_then(positive_u64) {
                    self.out_path_timeout_us = v;
                }
            }
            Some(v) => {
                if let Some(v) = positive_u64(v) {
                    self.out_path_timeout_us = v;
                }
            }
            None => {}
        }
        if let Some(v) = ns.get("path_check_interval").and_then(positive_u64) {
            self.check_interval_us = v;
        }
        self.adjust_in_path_timeout()
    }

    pub async fn from_config(config: &ConfigManager) -> Self {
        let mut info = Self::default();
        if let Some(v) = config.0.get_u64(ENV_IN_PATH_TIMEOUT).await.filter(|v| *v > 0) {
            info.in_path_timeout_us = v;
        }
        if let Some(v) = config.0.get_u64(ENV_OUT_PATH_TIMEOUT).await.filter(|v| *v > 0) {
            info.out_path_timeout_us = v;
        }
        if let Some(v) = config.0.get_u64(ENV_PATH_CHECK_INTERVAL).await.filter(|v| *v > 0) {
            info.check_interval_us = v;
        }
        info.adjust_in_path_timeout()
    }

    /// An IN path must outlive the OUT paths it waits on, plus one sweep and
    /// a second of slack.
    pub fn adjust_in_path_timeout(mut self) -> Self {
        let min_in = self
            .out_path_timeout_us
            .saturating_add(self.check_interval_us)
            .saturating_add(SAFETY_MARGIN_US);
        if self.in_path_timeout_us < min_in {
            warn!(
                configured = self.in_path_timeout_us,
                adjusted = min_in,
                "in path timeout raised above out path timeout"
            );
            self.in_path_timeout_us = min_in;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);
        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "EXTGRAPH_TEST_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("EXTGRAPH_TEST_KEY").await, Some("abc123".to_string()));

        mgr.set("EXTGRAPH_TEST_OTHER", "1").await.unwrap();
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("EXTGRAPH_TEST_OTHER=1"));

        mgr.del("EXTGRAPH_TEST_OTHER").await;
        mgr.del("EXTGRAPH_TEST_KEY").await;
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains("EXTGRAPH_TEST_"));
    }

    #[tokio::test]
    async fn test_timeouts_from_config() {
        let config = ConfigManager(MapConfigManager::new());
        config.0.set(ENV_OUT_PATH_TIMEOUT, "2000000").await.unwrap();
        config.0.set(ENV_PATH_CHECK_INTERVAL, "500000").await.unwrap();
        config.0.set(ENV_IN_PATH_TIMEOUT, "not a number").await.unwrap();

        let info = PathTimeoutInfo::from_config(&config).await;
        assert_eq!(info.out_path_timeout_us, 2_000_000);
        assert_eq!(info.check_interval_us, 500_000);
        assert_eq!(info.in_path_timeout_us, DEFAULT_PATH_TIMEOUT_US);
    }

    #[test]
    fn test_properties_object_form() {
        let props = json!({"_graph": {
            "path_timeout": {"in_path": 100_000_000u64, "out_path": 1_000_000},
            "path_check_interval": 200_000
        }});
        let info = PathTimeoutInfo::default().with_properties(&props);
        assert_eq!(info.in_path_timeout_us, 100_000_000);
        assert_eq!(info.out_path_timeout_us, 1_000_000);
        assert_eq!(info.check_interval_us, 200_000);
    }

    #[test]
    fn test_properties_integer_form_sets_out_only() {
        let props = json!({"_graph": {"path_timeout": 3_000_000}});
        let info = PathTimeoutInfo::default().with_properties(&props);
        assert_eq!(info.out_path_timeout_us, 3_000_000);
        assert_eq!(info.in_path_timeout_us, DEFAULT_PATH_TIMEOUT_US);
    }

    #[test]
    fn test_in_timeout_is_raised() {
        let props = json!({"_graph": {
            "path_timeout": {"in_path": 1, "out_path": 2_000_000},
            "path_check_interval": 500_000
        }});
        let info = PathTimeoutInfo::default().with_properties(&props);
        assert_eq!(info.in_path_timeout_us, 2_000_000 + 500_000 + 1_000_000);
    }

    #[test]
    fn test_adjust_saturates() {
        let info = PathTimeoutInfo {
            in_path_timeout_us: 0,
            out_path_timeout_us: u64::MAX - 10,
            check_interval_us: 100,
        }
        .adjust_in_path_timeout();
        assert_eq!(info.in_path_timeout_us, u64::MAX);
        assert_eq!(PathTimeoutInfo::never().adjust_in_path_timeout(), PathTimeoutInfo::never());
    }
}
