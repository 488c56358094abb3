//! Per-request payment enforcement.
//!
//! [`X402Paygate`] runs the full lifecycle for one gated request: extract
//! and decode the payment header, select the matching requirement, verify
//! with the facilitator, invoke the downstream handler, settle, and attach
//! the settlement receipt to the response.

use axum_core::body::Body;
use axum_core::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tower::Service;

use aeon_x402::facilitator::Facilitator;
use aeon_x402::networks;
use aeon_x402::proto;
use aeon_x402::proto::{v1, v2};
use aeon_x402::util::Base64Bytes;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, Level, instrument};

use crate::paywall;

/// V2 request header carrying the signed payment payload.
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
/// V2 response header mirroring the 402 body.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
/// Legacy V1 request header.
pub const X_PAYMENT_HEADER: &str = "x-payment";
/// Settlement receipt response header (both versions).
pub const X_PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

static ERR_PAYMENT_HEADER_REQUIRED: Lazy<String> =
    Lazy::new(|| "X-PAYMENT header is required".to_string());
static ERR_NO_PAYMENT_MATCHING: Lazy<String> =
    Lazy::new(|| "Unable to find matching payment requirements".to_string());

/// Enforces payment on one request, with the route's effective requirements
/// already resolved (resource URLs filled in).
pub struct X402Paygate<F> {
    pub facilitator: Arc<F>,
    pub payment_requirements: Vec<v2::PaymentRequirements>,
    pub resource: v2::ResourceInfo,
}

/// A `402 Payment Required` outcome, rendered as JSON or as the paywall
/// page depending on the caller.
#[derive(Debug)]
pub struct X402Error {
    payment_required: v2::PaymentRequired,
    browser: bool,
}

impl Display for X402Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "402 Payment Required: {}", self.payment_required.error)
    }
}

impl IntoResponse for X402Error {
    fn into_response(self) -> Response {
        let body_json = serde_json::to_value(&self.payment_required)
            .unwrap_or_else(|_| json!({ "error": self.payment_required.error }));
        let header_bytes = Base64Bytes::encode(body_json.to_string());
        let builder = Response::builder().status(StatusCode::PAYMENT_REQUIRED).header(
            PAYMENT_REQUIRED_HEADER,
            HeaderValue::from_bytes(header_bytes.as_ref())
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        let response = if self.browser {
            builder
                .header("Content-Type", "text/html; charset=utf-8")
                .body(Body::from(paywall::render(&body_json)))
        } else {
            builder
                .header("Content-Type", "application/json")
                .body(Body::from(body_json.to_string()))
        };
        response.unwrap_or_else(|_| StatusCode::PAYMENT_REQUIRED.into_response())
    }
}

/// Whether the caller is an HTML browser: accepts `text/html` and presents
/// a Mozilla-family user agent.
fn wants_html(headers: &HeaderMap) -> bool {
    let accepts_html = headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);
    let mozilla_ua = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("Mozilla"))
        .unwrap_or(false);
    accepts_html && mozilla_ua
}

impl<F> X402Paygate<F>
where
    F: Facilitator + Send + Sync,
{
    fn payment_required(&self, error: String, browser: bool, payer: Option<String>) -> X402Error {
        let accepts = self
            .payment_requirements
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        X402Error {
            payment_required: v2::PaymentRequired {
                x402_version: v2::X402Version2,
                error,
                resource: Some(self.resource.clone()),
                accepts,
                payer,
            },
            browser,
        }
    }

    /// Decodes the payment header into raw JSON, preferring the V2
    /// `payment-signature` header and falling back to legacy `X-PAYMENT`.
    fn extract_payment_payload(
        &self,
        headers: &HeaderMap,
        browser: bool,
    ) -> Result<serde_json::Value, X402Error> {
        let header = headers
            .get(PAYMENT_SIGNATURE_HEADER)
            .or_else(|| headers.get(X_PAYMENT_HEADER));
        let Some(header) = header else {
            return Err(self.payment_required(ERR_PAYMENT_HEADER_REQUIRED.clone(), browser, None));
        };
        let decoded = Base64Bytes::from(header.as_bytes())
            .decode()
            .map_err(|e| {
                self.payment_required(format!("Invalid payment header: {e}"), browser, None)
            })?;
        serde_json::from_slice(&decoded).map_err(|e| {
            self.payment_required(format!("Invalid payment header: {e}"), browser, None)
        })
    }

    /// Finds the single requirement whose scheme, network, and network id
    /// equal the payload's accepted entry (or the V1 top-level fields).
    fn select_requirement(
        &self,
        payload: &serde_json::Value,
    ) -> Option<&v2::PaymentRequirements> {
        let version = payload.get("x402Version")?.as_u64()?;
        let (scheme, network, network_id) = match version {
            1 => (
                payload.get("scheme")?.as_str()?,
                payload.get("network")?.as_str()?,
                None,
            ),
            2 => {
                let accepted = payload.get("accepted")?;
                (
                    accepted.get("scheme")?.as_str()?,
                    accepted.get("network")?.as_str()?,
                    accepted
                        .get("networkId")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                )
            }
            _ => return None,
        };
        let payload_chain = networks::eip155_reference_from_str(network);
        self.payment_requirements.iter().find(|requirement| {
            if requirement.scheme != scheme {
                return false;
            }
            let requirement_chain =
                networks::eip155_reference_from_str(&requirement.network.to_string());
            if requirement_chain != payload_chain {
                return false;
            }
            match (&network_id, &requirement.network_id) {
                (Some(payload_id), Some(required_id)) => payload_id == required_id,
                _ => true,
            }
        })
    }

    /// Verifies the payment with the facilitator. Returns the verify/settle
    /// request to reuse for settlement.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.verify_payment", skip_all, err)
    )]
    async fn verify_payment(
        &self,
        payload: serde_json::Value,
        browser: bool,
    ) -> Result<proto::VerifyRequest, X402Error> {
        let selected = self.select_requirement(&payload).ok_or_else(|| {
            self.payment_required(ERR_NO_PAYMENT_MATCHING.clone(), browser, None)
        })?;
        let version = payload
            .get("x402Version")
            .cloned()
            .unwrap_or_else(|| json!(v2::X402Version2::VALUE));
        let request: proto::VerifyRequest = json!({
            "x402Version": version,
            "paymentPayload": payload,
            "paymentRequirements": selected,
        })
        .into();
        let response = self.facilitator.verify(&request).await.map_err(|e| {
            self.payment_required(format!("Verification failed: {e}"), browser, None)
        })?;
        let response: v1::VerifyResponse = serde_json::from_value(response.0).map_err(|e| {
            self.payment_required(format!("Verification failed: {e}"), browser, None)
        })?;
        match response {
            v1::VerifyResponse::Valid { .. } => Ok(request),
            v1::VerifyResponse::Invalid { reason, payer } => Err(self.payment_required(
                format!("Verification failed: {reason}"),
                browser,
                payer,
            )),
        }
    }

    /// Settles a verified payment. Returns the settlement result for the
    /// response header.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.settle_payment", skip_all, err)
    )]
    async fn settle_payment(
        &self,
        request: &proto::SettleRequest,
        browser: bool,
    ) -> Result<v1::SettleResponse, X402Error> {
        let response = self.facilitator.settle(request).await.map_err(|e| {
            self.payment_required(format!("Settlement failed: {e}"), browser, None)
        })?;
        let response: v1::SettleResponse = serde_json::from_value(response.0).map_err(|e| {
            self.payment_required(format!("Settlement failed: {e}"), browser, None)
        })?;
        match response {
            v1::SettleResponse::Success { .. } => Ok(response),
            v1::SettleResponse::Error { reason, payer, .. } => Err(self.payment_required(
                format!("Settlement failed: {reason}"),
                browser,
                payer,
            )),
        }
    }

    /// Processes one gated request end to end.
    pub async fn call<S>(self, inner: S, req: http::Request<Body>) -> Result<Response, Infallible>
    where
        S: Service<http::Request<Body>, Response = Response, Error = Infallible> + Send,
        S::Future: Send,
    {
        Ok(self.handle_request(inner, req).await)
    }

    /// Verifies the request, invokes the downstream handler, settles, and
    /// attaches the `X-PAYMENT-RESPONSE` header.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.handle_request", skip_all)
    )]
    pub async fn handle_request<S>(self, mut inner: S, req: http::Request<Body>) -> Response
    where
        S: Service<http::Request<Body>, Response = Response, Error = Infallible> + Send,
        S::Future: Send,
    {
        let browser = wants_html(req.headers());
        let payload = match self.extract_payment_payload(req.headers(), browser) {
            Ok(payload) => payload,
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::event!(Level::INFO, status = "failed", "No valid payment provided");
                return err.into_response();
            }
        };
        let settle_request = match self.verify_payment(payload, browser).await {
            Ok(request) => request,
            Err(err) => return err.into_response(),
        };

        let inner_fut = inner.call(req);
        #[cfg(feature = "telemetry")]
        let inner_fut = inner_fut.instrument(tracing::info_span!("inner"));
        let response = match inner_fut.await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        // A failed handler gets no settlement: the client keeps its money.
        if response.status().is_client_error() || response.status().is_server_error() {
            return response;
        }

        let settlement = match self.settle_payment(&settle_request, browser).await {
            Ok(settlement) => settlement,
            Err(err) => return err.into_response(),
        };
        let settlement_json = match serde_json::to_vec(&settlement) {
            Ok(bytes) => bytes,
            Err(err) => {
                return self
                    .payment_required(format!("Settlement failed: {err}"), browser, None)
                    .into_response();
            }
        };
        let header_bytes = Base64Bytes::encode(settlement_json);
        let header_value = match HeaderValue::from_bytes(header_bytes.as_ref()) {
            Ok(header_value) => header_value,
            Err(err) => {
                return self
                    .payment_required(format!("Settlement failed: {err}"), browser, None)
                    .into_response();
            }
        };
        let mut res = response;
        res.headers_mut()
            .insert(X_PAYMENT_RESPONSE_HEADER, header_value);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_x402::chain::ChainId;
    use aeon_x402::proto::ErrorReason;

    struct NoFacilitator;

    impl Facilitator for NoFacilitator {
        type Error = std::convert::Infallible;

        async fn verify(
            &self,
            _request: &proto::VerifyRequest,
        ) -> Result<proto::VerifyResponse, Self::Error> {
            Ok(v1::VerifyResponse::invalid(None, ErrorReason::InsufficientFunds).into())
        }

        async fn settle(
            &self,
            _request: &proto::SettleRequest,
        ) -> Result<proto::SettleResponse, Self::Error> {
            Ok(v1::SettleResponse::Error {
                reason: ErrorReason::InvalidTransactionState.into(),
                network: "eip155:56".to_string(),
                transaction: None,
                payer: None,
            }
            .into())
        }

        async fn supported(&self) -> Result<proto::SupportedResponse, Self::Error> {
            Ok(proto::SupportedResponse::default())
        }
    }

    fn requirement(network: &str, network_id: Option<&str>) -> v2::PaymentRequirements {
        v2::PaymentRequirements {
            scheme: "exact".to_string(),
            network: network.parse::<ChainId>().unwrap(),
            network_id: network_id.map(str::to_string),
            amount: Some(1000u64.into()),
            amount_required: None,
            token_decimals: None,
            pay_to: "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
            asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap(),
            max_timeout_seconds: 300,
            extra: None,
            resource: None,
            description: String::new(),
            mime_type: None,
        }
    }

    fn paygate(requirements: Vec<v2::PaymentRequirements>) -> X402Paygate<NoFacilitator> {
        X402Paygate {
            facilitator: Arc::new(NoFacilitator),
            payment_requirements: requirements,
            resource: v2::ResourceInfo {
                url: "https://api.example.com/premium".to_string(),
                description: String::new(),
                mime_type: "application/json".to_string(),
            },
        }
    }

    #[test]
    fn selects_v2_requirement_by_network() {
        let gate = paygate(vec![
            requirement("eip155:8453", None),
            requirement("eip155:56", None),
        ]);
        let payload = json!({
            "x402Version": 2,
            "accepted": { "scheme": "exact", "network": "eip155:56" }
        });
        let selected = gate.select_requirement(&payload).unwrap();
        assert_eq!(selected.network.to_string(), "eip155:56");
    }

    #[test]
    fn selects_v1_requirement_by_network_name() {
        let gate = paygate(vec![requirement("eip155:56", None)]);
        let payload = json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "bsc"
        });
        assert!(gate.select_requirement(&payload).is_some());
    }

    #[test]
    fn network_id_mismatch_rejects() {
        let gate = paygate(vec![requirement("eip155:56", Some("56"))]);
        let payload = json!({
            "x402Version": 2,
            "accepted": { "scheme": "exact", "network": "eip155:56", "networkId": "8453" }
        });
        assert!(gate.select_requirement(&payload).is_none());
    }

    #[test]
    fn scheme_mismatch_rejects() {
        let gate = paygate(vec![requirement("eip155:56", None)]);
        let payload = json!({
            "x402Version": 2,
            "accepted": { "scheme": "upto", "network": "eip155:56" }
        });
        assert!(gate.select_requirement(&payload).is_none());
    }

    #[test]
    fn browser_detection_needs_accept_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_html(&headers));
        headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0"),
        );
        assert!(wants_html(&headers));
    }

    #[test]
    fn missing_header_produces_402_with_accepts() {
        let gate = paygate(vec![requirement("eip155:56", None)]);
        let headers = HeaderMap::new();
        let err = gate
            .extract_payment_payload(&headers, false)
            .unwrap_err();
        assert_eq!(err.payment_required.error, "X-PAYMENT header is required");
        assert_eq!(err.payment_required.accepts.len(), 1);
    }

    #[test]
    fn undecodable_header_produces_decode_error() {
        let gate = paygate(vec![requirement("eip155:56", None)]);
        let mut headers = HeaderMap::new();
        headers.insert(
            PAYMENT_SIGNATURE_HEADER,
            HeaderValue::from_static("%%%not-base64%%%"),
        );
        let err = gate
            .extract_payment_payload(&headers, false)
            .unwrap_err();
        assert!(err.payment_required.error.starts_with("Invalid payment header"));
    }
}
