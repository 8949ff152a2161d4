//! External verification gateway client
//!
//! An optional HTTP service that cross-checks a delivered transfer before
//! the relayer finalizes settlement. When no gateway is configured, the
//! processor falls back to the settlement contract's finalized read-back.

use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VerificationConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBridgeRequest {
    pub request_id: String,
    pub origin_claim_tx_hash: String,
    pub dest_transfer_signature: String,
    pub dest_address: String,
    pub amount: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBridgeResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub verified: Option<bool>,
}

impl VerifyBridgeResponse {
    pub fn is_verified(&self) -> bool {
        self.success && self.verified.unwrap_or(true)
    }
}

/// HTTP client for the verification gateway.
pub struct VerificationGateway {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl VerificationGateway {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build verification HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    /// Ask the gateway to verify a delivered transfer.
    pub async fn verify_bridge(
        &self,
        request: &VerifyBridgeRequest,
    ) -> Result<VerifyBridgeResponse> {
        let url = format!("{}/verify-bridge", self.base_url);
        debug!(request_id = %request.request_id, url = %url, "Requesting verification");

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .wrap_err("Verification gateway request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!(
                "Verification gateway returned {}: {}",
                status,
                body
            ));
        }

        response
            .json()
            .await
            .wrap_err("Verification gateway returned malformed JSON")
    }

    /// Gateway liveness probe.
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Verification gateway health check failed")?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_camel_case() {
        let req = VerifyBridgeRequest {
            request_id: format!("0x{}", "ab".repeat(32)),
            origin_claim_tx_hash: format!("0x{}", "cd".repeat(32)),
            dest_transfer_signature: "5xYz".to_string(),
            dest_address: "recipient".to_string(),
            amount: "1000000".to_string(),
            token: format!("0x{}", "11".repeat(32)),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("requestId"));
        assert!(json.contains("originClaimTxHash"));
        assert!(json.contains("destTransferSignature"));
        assert!(!json.contains("request_id"));
    }

    #[test]
    fn test_response_verified_logic() {
        let ok: VerifyBridgeResponse =
            serde_json::from_str(r#"{"success":true,"message":"ok","verified":true}"#).unwrap();
        assert!(ok.is_verified());

        // verified omitted: success alone is accepted
        let implicit: VerifyBridgeResponse =
            serde_json::from_str(r#"{"success":true,"message":"ok"}"#).unwrap();
        assert!(implicit.is_verified());

        let rejected: VerifyBridgeResponse =
            serde_json::from_str(r#"{"success":true,"message":"mismatch","verified":false}"#)
                .unwrap();
        assert!(!rejected.is_verified());

        let failed: VerifyBridgeResponse =
            serde_json::from_str(r#"{"success":false,"message":"error"}"#).unwrap();
        assert!(!failed.is_verified());
    }
}
