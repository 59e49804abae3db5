//! Configuration surface.
//!
//! Loaded from a YAML or JSON file, or assembled in memory by embedders.
//! Field defaults follow the conventions the server ships with; every
//! block is optional except the spec document itself.

use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::rules::DelaySpec;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// OpenAPI document: a file path or an inline document.
    pub oas: Option<DocumentSource>,
    /// Scenarios: a file path or an inline scenarios list.
    pub scenarios: Option<DocumentSource>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
    /// Seed string driving template RNG and data generation.
    pub seed: Option<String>,
    pub chaos: Option<ChaosConfig>,
    /// Reserved for the record/replay proxy.
    pub proxy: Option<Value>,
}

impl SandboxConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config = match serde_json::from_str::<SandboxConfig>(&raw) {
            Ok(config) => config,
            Err(_) => serde_yaml::from_str::<SandboxConfig>(&raw)
                .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?,
        };
        Ok(config)
    }
}

/// A path on disk or an inline document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DocumentSource {
    Path(PathBuf),
    Inline(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreConfig {
    Memory(MemoryStoreConfig),
    File(FileStoreConfig),
    Network(NetworkStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory(MemoryStoreConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStoreConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Applied when `set` is called without a TTL.
    #[serde(default)]
    pub default_ttl: Option<u64>,
    #[serde(default = "default_wheel_slots")]
    pub wheel_slots: usize,
}

fn default_max_size() -> usize {
    10_000
}

fn default_wheel_slots() -> usize {
    3600
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        MemoryStoreConfig {
            max_size: default_max_size(),
            default_ttl: None,
            wheel_slots: default_wheel_slots(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStoreConfig {
    /// Base path; the store writes `<base>.log` and `<base>.snapshot`.
    pub path: PathBuf,
    /// Seconds between compaction passes; `None` compacts only on shutdown.
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval: Option<u64>,
    #[serde(default = "default_true")]
    pub snapshot_on_shutdown: bool,
}

fn default_compaction_interval() -> Option<u64> {
    Some(300)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStoreConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "sandbox:".to_string()
}

fn default_pool_size() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateConfig {
    #[serde(default = "default_true")]
    pub requests: bool,
    #[serde(default)]
    pub responses: ResponseValidation,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        ValidateConfig {
            requests: true,
            responses: ResponseValidation::default(),
        }
    }
}

/// Response validation mode: `"strict"`, `"warn"`, or `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseValidation {
    Strict,
    #[default]
    Warn,
    Off,
}

impl<'de> Deserialize<'de> for ResponseValidation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Bool(false) => Ok(ResponseValidation::Off),
            Value::String(s) if s == "strict" => Ok(ResponseValidation::Strict),
            Value::String(s) if s == "warn" => Ok(ResponseValidation::Warn),
            other => Err(D::Error::custom(format!(
                "responses must be \"strict\", \"warn\" or false, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    /// Added to every request before rule execution.
    pub latency: Option<DelaySpec>,
    /// Probability in `[0, 1]` of replacing the response with a 500.
    #[serde(default)]
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: SandboxConfig = serde_yaml::from_str("{}").unwrap();
        assert!(matches!(config.store, StoreConfig::Memory(_)));
        assert!(config.validate.requests);
        assert_eq!(config.validate.responses, ResponseValidation::Warn);
        assert!(config.chaos.is_none());
    }

    #[test]
    fn test_store_variants() {
        let yaml = r#"
store:
  file:
    path: /tmp/sandbox-state
    compactionInterval: 60
"#;
        let config: SandboxConfig = serde_yaml::from_str(yaml).unwrap();
        match config.store {
            StoreConfig::File(f) => {
                assert_eq!(f.compaction_interval, Some(60));
                assert!(f.snapshot_on_shutdown);
            }
            other => panic!("unexpected store config: {other:?}"),
        }

        let yaml = r#"
store:
  network:
    host: redis.internal
    password: hunter2
    keyPrefix: "mock:"
"#;
        let config: SandboxConfig = serde_yaml::from_str(yaml).unwrap();
        match config.store {
            StoreConfig::Network(n) => {
                assert_eq!(n.port, 6379);
                assert_eq!(n.key_prefix, "mock:");
                assert_eq!(n.db, 0);
            }
            other => panic!("unexpected store config: {other:?}"),
        }
    }

    #[test]
    fn test_response_validation_forms() {
        let config: SandboxConfig =
            serde_yaml::from_str("validate: {responses: strict}").unwrap();
        assert_eq!(config.validate.responses, ResponseValidation::Strict);

        let config: SandboxConfig =
            serde_yaml::from_str("validate: {responses: false}").unwrap();
        assert_eq!(config.validate.responses, ResponseValidation::Off);

        assert!(serde_yaml::from_str::<SandboxConfig>("validate: {responses: maybe}").is_err());
    }

    #[test]
    fn test_chaos_block() {
        let config: SandboxConfig =
            serde_yaml::from_str("chaos: {latency: \"50±10ms\", errorRate: 0.25}").unwrap();
        let chaos = config.chaos.unwrap();
        assert!(chaos.latency.is_some());
        assert!((chaos.error_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_inline_oas_source() {
        let config: SandboxConfig =
            serde_yaml::from_str("oas: {openapi: \"3.0.0\", paths: {}}").unwrap();
        assert!(matches!(config.oas, Some(DocumentSource::Inline(_))));

        let config: SandboxConfig = serde_yaml::from_str("oas: ./spec.yaml").unwrap();
        assert!(matches!(config.oas, Some(DocumentSource::Path(_))));
    }
}
