//! Connectivity probe for an external AI endpoint.
//!
//! The backend never proxies completions; it only answers "can this
//! endpoint be reached with these credentials" so the caller can validate
//! its settings.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoint settings under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConnectionConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Probe the endpoint with a single GET. Success is any 2xx response.
pub async fn test_connection(config: &AiConnectionConfig) -> AppResult<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| AppError::Unknown(format!("Failed to build HTTP client: {}", e)))?;

    let mut request = client.get(&config.endpoint);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(format!("AI endpoint timed out: {}", config.endpoint))
        } else {
            AppError::NetworkUnreachable(format!("AI endpoint unreachable: {}", e))
        }
    })?;

    let status = response.status();
    if status.is_success() {
        tracing::info!("AI endpoint {} reachable ({})", config.endpoint, status);
        Ok(())
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(AppError::AuthFailure(format!(
            "AI endpoint rejected credentials ({})",
            status
        )))
    } else {
        Err(AppError::NetworkUnreachable(format!(
            "AI endpoint returned {}",
            status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserializes_without_key() {
        let config: AiConnectionConfig =
            serde_json::from_str(r#"{"endpoint": "http://localhost:11434"}"#).unwrap();
        assert_eq!(config.endpoint, "http://localhost:11434");
        assert!(config.api_key.is_none());
        assert!(config.model.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_maps_to_network_error() {
        let config = AiConnectionConfig {
            // reserved TEST-NET address, nothing listens there
            endpoint: "http://192.0.2.1:9/".to_string(),
            api_key: None,
            model: None,
        };
        let err = test_connection(&config).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::NetworkUnreachable(_) | AppError::Timeout(_)
        ));
    }
}
