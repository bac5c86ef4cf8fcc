//! Configuration loading
//!
//! YAML or TOML chosen by file extension, with a validation pass after parse.

mod types;

pub use types::*;

use crate::error::{Result, TraceLabError};
use std::path::Path;
use tracing::info;

/// Load and validate configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        TraceLabError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;

    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded successfully from {:?}", path);
    Ok(config)
}

/// Parse configuration from string content
fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(TraceLabError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}

/// Reject configurations the server cannot start with
pub fn validate_config(config: &Config) -> Result<()> {
    if config.upstream.base_url.is_empty() {
        return Err(TraceLabError::ConfigValidation(
            "upstream.base_url must be set".to_string(),
        ));
    }
    let uri = config
        .upstream
        .base_url
        .parse::<http::Uri>()
        .map_err(|e| {
            TraceLabError::ConfigValidation(format!(
                "upstream.base_url is not a valid URL: {}",
                e
            ))
        })?;
    if uri.host().is_none() {
        return Err(TraceLabError::ConfigValidation(
            "upstream.base_url must carry a host".to_string(),
        ));
    }

    for (i, rule) in config.chaos.rules.iter().enumerate() {
        if !(0.0..=1.0).contains(&rule.rate) {
            return Err(TraceLabError::ConfigValidation(format!(
                "chaos.rules[{}].rate must be between 0.0 and 1.0, got {}",
                i, rule.rate
            )));
        }
        if rule.model.is_empty() {
            return Err(TraceLabError::ConfigValidation(format!(
                "chaos.rules[{}].model must be set (use \"*\" for all models)",
                i
            )));
        }
    }

    Ok(())
}
