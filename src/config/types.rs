//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Dashboard listener settings
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Upstream provider settings
    pub upstream: UpstreamSettings,

    /// Recording settings
    #[serde(default)]
    pub debug: DebugSettings,

    /// Chaos fault injection settings
    #[serde(default)]
    pub chaos: ChaosSettings,
}

/// Proxy listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Listen port for the proxy
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

fn default_server_port() -> u16 {
    8080
}

/// Dashboard listener settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    /// Listen port for the dashboard; absent disables it
    #[serde(default)]
    pub port: Option<u16>,
}

/// Upstream provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Base URL of the OpenAI-compatible provider
    pub base_url: String,

    /// API key substituted into forwarded Authorization headers
    #[serde(default)]
    pub api_key: String,
}

/// Recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugSettings {
    /// Root directory for recorded files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Replace the recorded Authorization header with a fake key
    #[serde(default)]
    pub mask_key: bool,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            mask_key: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("records")
}

/// Chaos fault injection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChaosSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Rules evaluated in declaration order; the first match wins
    #[serde(default)]
    pub rules: Vec<ChaosRule>,
}

/// One chaos rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChaosRule {
    /// Model to target; `*` matches every model
    pub model: String,

    /// Firing probability, 0.0 - 1.0
    pub rate: f64,

    /// What to do when the rule fires
    pub action: ChaosAction,

    /// Sleep duration for the `delay` action
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,

    /// Status code for the `error` action; 0 falls back to 500
    #[serde(default)]
    pub status_code: u16,

    /// Response body for the `error` action
    #[serde(default)]
    pub message: String,
}

/// Chaos rule actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChaosAction {
    /// Sleep, then forward to the upstream normally
    Delay,
    /// Respond locally without contacting the upstream
    Error,
}
