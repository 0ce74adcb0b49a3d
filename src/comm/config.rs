//! 驱动配置（DriverConfigV1）：JSON 文件，字段 camelCase，带 schemaVersion。

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::core::model::{INIT_POLLER, SCHEMA_VERSION_V1};

fn default_plc_type() -> String {
    "omron-njnx".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_optimise_threshold() -> usize {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollerConfig {
    pub name: String,
    pub update_rate_ms: u64,
    /// 把本组的读请求在一个周期内错开发出
    #[serde(default)]
    pub spread_requests: bool,
}

impl PollerConfig {
    pub fn new(name: impl Into<String>, update_rate_ms: u64) -> Self {
        Self {
            name: name.into(),
            update_rate_ms,
            spread_requests: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfigV1 {
    pub schema_version: u32,
    pub gateway: String,
    pub path: String,
    #[serde(default = "default_plc_type")]
    pub plc_type: String,
    #[serde(default = "default_timeout_ms")]
    pub create_tag_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_optimise_threshold")]
    pub optimise_threshold: usize,
    /// PLC 时钟相对 UTC 的小时偏移
    #[serde(default)]
    pub timezone_offset_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub struct_file: Option<String>,
    #[serde(default)]
    pub pollers: Vec<PollerConfig>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config error: unsupported schemaVersion {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("config error: gateway must not be empty")]
    EmptyGateway,

    #[error("config error: poller name must not be empty")]
    EmptyPollerName,

    #[error("config error: duplicate poller '{0}'")]
    DuplicatePoller(String),

    #[error("config error: poller name '{0}' is reserved")]
    ReservedPoller(String),

    #[error("config error: poller '{0}' needs an update rate above 0 ms")]
    ZeroUpdateRate(String),
}

impl DriverConfigV1 {
    pub fn new(gateway: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1,
            gateway: gateway.into(),
            path: path.into(),
            plc_type: default_plc_type(),
            create_tag_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            optimise_threshold: default_optimise_threshold(),
            timezone_offset_hours: 0.0,
            struct_file: None,
            pollers: Vec::new(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read driver config from: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse driver config JSON from: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid driver config: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION_V1 {
            return Err(ConfigError::UnsupportedSchemaVersion(self.schema_version));
        }
        if self.gateway.trim().is_empty() {
            return Err(ConfigError::EmptyGateway);
        }

        let mut seen = HashSet::new();
        for poller in &self.pollers {
            validate_poller(poller)?;
            if !seen.insert(poller.name.as_str()) {
                return Err(ConfigError::DuplicatePoller(poller.name.clone()));
            }
        }
        Ok(())
    }

    /// `protocol=ab-eip&gateway=..&path=..&plc=..`
    pub fn connection_prefix(&self) -> String {
        format!(
            "protocol=ab-eip&gateway={}&path={}&plc={}",
            self.gateway, self.path, self.plc_type
        )
    }
}

pub fn validate_poller(poller: &PollerConfig) -> Result<(), ConfigError> {
    if poller.name.trim().is_empty() {
        return Err(ConfigError::EmptyPollerName);
    }
    if poller.name == INIT_POLLER {
        return Err(ConfigError::ReservedPoller(poller.name.clone()));
    }
    if poller.update_rate_ms == 0 {
        return Err(ConfigError::ZeroUpdateRate(poller.name.clone()));
    }
    Ok(())
}
