use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, info};

use crate::broker::DEFAULT_REVIEW_TIMEOUT;
use crate::coordinator::CheckpointFlags;

pub const TIMEOUT_KEY: &str = "HITL_TIMEOUT_SECONDS";
pub const WS_ADDRESS_KEY: &str = "HITL_WS_ADDRESS";
pub const WS_PORT_KEY: &str = "HITL_WS_PORT";
pub const AFTER_PLAN_GENERATION_KEY: &str = "HITL_AFTER_PLAN_GENERATION";
pub const AFTER_ATOMIZER_KEY: &str = "HITL_AFTER_ATOMIZER";
pub const BEFORE_EXECUTE_KEY: &str = "HITL_BEFORE_EXECUTE";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

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

/// Process environment, seeded from a `.env` file which `set`/`del` keep in
/// sync.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            error!("could not load .env from {}", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

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
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = content
            .lines()
            .map(|line| match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    format!("{key}={value}")
                }
                _ => line.to_string(),
            })
            .collect();
        if !found {
            lines.push(format!("{key}={value}"));
        }

        if let Some(dir) = self.env_file.parent() {
            fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())?;

        Ok(())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if let Ok(content) = fs::read_to_string(&self.env_file) {
            let lines: Vec<&str> = content
                .lines()
                .filter(|line| match line.split_once('=') {
                    Some((k, _)) => k.trim() != key,
                    None => true,
                })
                .collect();

            let _ = fs::write(&self.env_file, lines.join("\n"));
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }
}

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

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the HITL runtime reads at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct HitlSettings {
    pub timeout: Duration,
    pub ws_address: String,
    pub ws_port: u16,
    pub flags: CheckpointFlags,
}

impl Default for HitlSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REVIEW_TIMEOUT,
            ws_address: "0.0.0.0".to_string(),
            ws_port: 8888,
            flags: CheckpointFlags::default(),
        }
    }
}

impl HitlSettings {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = HitlSettings::default();

        let timeout = match config.0.get(TIMEOUT_KEY).await {
            Some(raw) => parse_timeout(&raw)?,
            None => defaults.timeout,
        };
        let ws_address = config
            .0
            .get(WS_ADDRESS_KEY)
            .await
            .unwrap_or(defaults.ws_address);
        let ws_port = match config.0.get(WS_PORT_KEY).await {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: WS_PORT_KEY,
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.ws_port,
        };
        let flags = CheckpointFlags {
            after_plan_generation: read_flag(config, AFTER_PLAN_GENERATION_KEY).await?,
            after_atomizer: read_flag(config, AFTER_ATOMIZER_KEY).await?,
            before_execute: read_flag(config, BEFORE_EXECUTE_KEY).await?,
        };

        Ok(Self {
            timeout,
            ws_address,
            ws_port,
            flags,
        })
    }

    pub fn ws_bind_addr(&self) -> String {
        format!("{}:{}", self.ws_address, self.ws_port)
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: TIMEOUT_KEY,
        value: raw.to_string(),
        reason,
    };
    let secs = raw.trim().parse::<f64>().map_err(|e| invalid(e.to_string()))?;
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(e.to_string()))
}

async fn read_flag(config: &ConfigManager, key: &'static str) -> Result<bool, ConfigError> {
    let Some(raw) = config.0.get(key).await else {
        return Ok(false);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::{TempDir, tempdir};

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));

        let keys = mgr.keys().await;
        assert_eq!(keys, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_map_config_manager_as_vec() {
        let mgr = MapConfigManager::new();
        mgr.set("a", "1").await.unwrap();
        mgr.set("b", "2").await.unwrap();

        let mut config = mgr.as_vec().await;
        config.sort();

        assert_eq!(
            config,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_env_config_manager_set_and_delete_persist() {
        let key = "HITLGATE_TEST_ENV_SET_DEL";
        let tmp = TempDir::new().unwrap();
        let env = tmp.path().join("config").join(".env");

        let mgr = EnvConfigManager::new(env.clone());

        mgr.set(key, "42").await.unwrap();
        assert_eq!(std::env::var(key).ok(), Some("42".to_string()));
        assert!(std::fs::read_to_string(&env).unwrap().contains(&format!("{key}=42")));

        mgr.set(key, "43").await.unwrap();
        let content = std::fs::read_to_string(&env).unwrap();
        assert_eq!(content.matches(key).count(), 1);
        assert!(content.contains(&format!("{key}=43")));

        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
        assert!(!std::fs::read_to_string(&env).unwrap().contains(key));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");

        let content = "HITLGATE_TEST_API_KEY=abc123\nHITLGATE_TEST_LOG_LEVEL=debug\n";
        write(&env_path, content).unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());

        assert_eq!(
            mgr.get("HITLGATE_TEST_API_KEY").await,
            Some("abc123".to_string())
        );
        assert_eq!(
            mgr.get("HITLGATE_TEST_LOG_LEVEL").await,
            Some("debug".to_string())
        );
    }

    #[tokio::test]
    async fn test_settings_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let settings = HitlSettings::load(&config).await.unwrap();
        assert_eq!(settings, HitlSettings::default());
        assert_eq!(settings.timeout, Duration::from_secs(1800));
        assert_eq!(settings.ws_bind_addr(), "0.0.0.0:8888");
        assert!(!settings.flags.before_execute);
    }

    #[tokio::test]
    async fn test_settings_overrides() {
        let config = ConfigManager(MapConfigManager::new());
        config.0.set(TIMEOUT_KEY, "2.5").await.unwrap();
        config.0.set(WS_ADDRESS_KEY, "127.0.0.1").await.unwrap();
        config.0.set(WS_PORT_KEY, "9001").await.unwrap();
        config.0.set(AFTER_PLAN_GENERATION_KEY, "yes").await.unwrap();
        config.0.set(BEFORE_EXECUTE_KEY, "1").await.unwrap();

        let settings = HitlSettings::load(&config).await.unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(2500));
        assert_eq!(settings.ws_bind_addr(), "127.0.0.1:9001");
        assert!(settings.flags.after_plan_generation);
        assert!(!settings.flags.after_atomizer);
        assert!(settings.flags.before_execute);
    }

    #[tokio::test]
    async fn test_settings_reject_bad_values() {
        let config = ConfigManager(MapConfigManager::new());
        config.0.set(TIMEOUT_KEY, "-5").await.unwrap();
        let err = HitlSettings::load(&config).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: TIMEOUT_KEY, .. }));

        config.0.set(TIMEOUT_KEY, "30").await.unwrap();
        config.0.set(AFTER_ATOMIZER_KEY, "maybe").await.unwrap();
        let err = HitlSettings::load(&config).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value `maybe` for HITL_AFTER_ATOMIZER: expected a boolean"
        );
    }
}
