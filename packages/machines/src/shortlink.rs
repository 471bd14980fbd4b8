// ABOUTME: Client for the external short-link service machines register with
// ABOUTME: Checks whether a unique path is still free before it is assigned

use crate::error::{MachineError, Result};
use crate::types::validate_unique_path;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use vmweb_config::Config;

/// Status the service answers with for an unclaimed path
pub const AVAILABLE_STATUS: u16 = 209;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAvailability {
    pub available: bool,
    pub status_code: u16,
}

#[derive(Debug, Clone)]
pub struct ShortLinkClient {
    client: reqwest::Client,
    base_url: String,
}

impl ShortLinkClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.shortlink_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_path_available(&self, unique_path: &str) -> Result<PathAvailability> {
        validate_unique_path(unique_path)?;

        let url = format!("{}/{}", self.base_url, unique_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MachineError::Upstream(format!("Request to {} failed: {}", url, e)))?;

        let status_code = response.status().as_u16();
        debug!("Short-link lookup for {} returned {}", unique_path, status_code);

        Ok(PathAvailability {
            available: status_code == AVAILABLE_STATUS,
            status_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_invalid_path_rejected_without_request() {
        let client = ShortLinkClient::new("http://127.0.0.1:9");
        let err = client.is_path_available("a/b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_upstream_failure() {
        // Port 9 (discard) is closed on test hosts
        let client = ShortLinkClient::new("http://127.0.0.1:9/");
        let err = client.is_path_available("demo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
    }
}
