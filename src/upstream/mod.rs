//! Upstream connectivity self-check
//!
//! Called once at startup: a failing upstream should abort the process
//! before the proxy starts accepting traffic.

use crate::error::{Result, TraceLabError};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// `<base>/v1/models`, tolerating base URLs that already end in `/v1`.
fn models_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(bare) = trimmed.strip_suffix("/v1") {
        format!("{}/v1/models", bare)
    } else {
        format!("{}/v1/models", trimmed)
    }
}

/// Verify the upstream answers an authenticated `/v1/models` call.
///
/// Returns the advertised model ids on success; an unreachable upstream or a
/// non-200 status is an error. A 200 with an unparseable body still passes:
/// connectivity is what is being checked.
pub async fn check_connectivity(base_url: &str, api_key: &str) -> Result<Vec<String>> {
    let url = models_url(base_url);
    info!(url = %url, "starting upstream connectivity check");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(true)
        .build()?;

    let response = client
        .get(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|e| TraceLabError::SelfCheck(format!("connection to {} failed: {}", url, e)))?;

    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();

    if status != reqwest::StatusCode::OK {
        return Err(TraceLabError::SelfCheck(format!(
            "upstream returned {} from {}: {}",
            status,
            url,
            String::from_utf8_lossy(&body)
        )));
    }

    match serde_json::from_slice::<ModelsResponse>(&body) {
        Ok(models) => {
            let ids: Vec<String> = models.data.into_iter().map(|m| m.id).collect();
            info!(models = ids.len(), "upstream connectivity check passed");
            Ok(ids)
        }
        Err(e) => {
            warn!(error = %e, "connectivity check passed, but model list did not parse");
            Ok(Vec::new())
        }
    }
}
