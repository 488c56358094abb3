//! Sponsored (gasless) settlement through a paymaster service.
//!
//! On BNB Chain the facilitator can settle without spending gas: the
//! paymaster is asked whether the fully-formed facilitator call is
//! sponsorable at zero gas price, and if so the transaction goes out with
//! `gasPrice = 0` and the paymaster covers it under the configured policy.

use alloy_primitives::{Address, Bytes};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

/// Paymaster connection settings, from scheme configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterConfig {
    /// Sponsorship validation endpoint.
    pub sponsor_url: Url,
    /// Sponsorship policy identifier.
    pub policy_uuid: String,
}

/// Client for the paymaster's sponsorship API.
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    client: reqwest::Client,
    config: PaymasterConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SponsorValidateRequest<'a> {
    chain_id: u64,
    policy_uuid: &'a str,
    from: Address,
    to: Address,
    data: &'a Bytes,
    gas_price: &'a str,
}

/// The paymaster's answer for one call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorDecision {
    /// Whether the call will be sponsored at zero gas price.
    pub sponsorable: bool,
    /// Gas limit the paymaster validated against, when provided.
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// Why sponsorship was declined, when it was.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymasterError {
    #[error("Paymaster transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Paymaster returned status {0}")]
    Status(StatusCode),
    #[error("Call is not sponsorable: {}", reason.as_deref().unwrap_or("no reason given"))]
    NotSponsorable { reason: Option<String> },
}

impl PaymasterClient {
    pub fn new(config: PaymasterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Asks the paymaster whether the call is sponsorable with `gasPrice = 0`.
    ///
    /// # Errors
    ///
    /// [`PaymasterError::NotSponsorable`] when the paymaster declines;
    /// transport and status errors otherwise. Callers fall back to the
    /// facilitator-paid path on any error.
    #[instrument(skip_all, fields(chain_id = chain_id, from = %from), err)]
    pub async fn validate(
        &self,
        chain_id: u64,
        from: Address,
        to: Address,
        data: &Bytes,
    ) -> Result<SponsorDecision, PaymasterError> {
        let request = SponsorValidateRequest {
            chain_id,
            policy_uuid: &self.config.policy_uuid,
            from,
            to,
            data,
            gas_price: "0",
        };
        let response = self
            .client
            .post(self.config.sponsor_url.clone())
            .json(&request)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(PaymasterError::Status(response.status()));
        }
        let decision: SponsorDecision = response.json().await?;
        if !decision.sponsorable {
            return Err(PaymasterError::NotSponsorable {
                reason: decision.reason.clone(),
            });
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> PaymasterClient {
        PaymasterClient::new(PaymasterConfig {
            sponsor_url: server.uri().parse().unwrap(),
            policy_uuid: "7b1a9c4e-policy".to_string(),
        })
    }

    #[tokio::test]
    async fn sponsorable_call_returns_decision() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "chainId": 56,
                "policyUuid": "7b1a9c4e-policy",
                "gasPrice": "0"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sponsorable": true,
                "gasLimit": 210000
            })))
            .mount(&server)
            .await;
        let client = client(&server).await;
        let decision = client
            .validate(
                56,
                address!("0x34b72535f371dc25ffa8654a1b2a18beab91f510"),
                address!("0x555e3311a9893c9B17444C1Ff0d88192a57Ef13e"),
                &Bytes::from(vec![0xab, 0xcd]),
            )
            .await
            .unwrap();
        assert_eq!(decision.gas_limit, Some(210000));
    }

    #[tokio::test]
    async fn declined_sponsorship_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sponsorable": false,
                "reason": "policy exhausted"
            })))
            .mount(&server)
            .await;
        let client = client(&server).await;
        let error = client
            .validate(56, Address::ZERO, Address::ZERO, &Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PaymasterError::NotSponsorable { reason: Some(ref r) } if r == "policy exhausted"
        ));
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = client(&server).await;
        let error = client
            .validate(56, Address::ZERO, Address::ZERO, &Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(error, PaymasterError::Status(status) if status.as_u16() == 503));
    }
}
