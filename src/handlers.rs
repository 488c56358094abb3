//! HTTP endpoints of the facilitator.
//!
//! Protocol-critical endpoints (`POST /verify`, `POST /settle`), discovery
//! endpoints (`/supported`, GET descriptors), and liveness (`/`, `/health`).
//! All payloads are JSON; an `Authorization: Bearer` header is enforced on
//! the protocol endpoints when an API key is configured.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router, response::IntoResponse};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::facilitator::Facilitator;
use crate::facilitator_local::FacilitatorLocalError;
use crate::proto;
use crate::proto::v1::SettleErrorReason;
use crate::proto::{AsPaymentProblem, ErrorReason};
use crate::scheme::X402SchemeFacilitatorError;

/// Shared state of the facilitator server: the facilitator itself and the
/// optional API key guarding the protocol endpoints.
pub struct FacilitatorState<A> {
    pub facilitator: A,
    pub api_key: Option<String>,
}

pub fn routes<A>() -> Router<Arc<FacilitatorState<A>>>
where
    A: Facilitator + Send + Sync + 'static,
    A::Error: IntoResponse,
{
    Router::new()
        .route("/", get(get_root))
        .route("/verify", get(get_verify_info))
        .route("/verify", post(post_verify::<A>))
        .route("/settle", get(get_settle_info))
        .route("/settle", post(post_settle::<A>))
        .route("/supported", get(get_supported::<A>))
        .route("/supported", post(get_supported::<A>))
        .route("/health", get(get_health::<A>))
}

/// Checks the `Authorization: Bearer` header against the configured key.
///
/// No configured key means open access. A configured key turns a missing or
/// mismatched header into a 401.
fn assert_bearer(headers: &HeaderMap, expected: &Option<String>) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid or missing Bearer token" })),
        )
            .into_response()),
    }
}

/// `GET /`: a greeting, doubling as a trivial liveness check.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /verify`: machine-readable description of the `/verify` endpoint.
#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

/// `GET /settle`: machine-readable description of the `/settle` endpoint.
#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle x402 payments",
        "body": {
            "paymentPayload": "PaymentPayload",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

/// `GET|POST /supported`: the payment kinds this facilitator can handle,
/// with the signer addresses per chain.
#[instrument(skip_all)]
pub async fn get_supported<A>(
    State(state): State<Arc<FacilitatorState<A>>>,
    headers: HeaderMap,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    if let Err(response) = assert_bearer(&headers, &state.api_key) {
        return response;
    }
    match state.facilitator.supported().await {
        Ok(supported) => (StatusCode::OK, Json(json!(supported))).into_response(),
        Err(error) => error.into_response(),
    }
}

pub async fn get_health<A>(
    State(state): State<Arc<FacilitatorState<A>>>,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    match state.facilitator.supported().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /verify`: facilitator-side verification of a proposed payment.
///
/// Responds 200 with `{isValid: true, payer}` on success, 4xx with
/// `{isValid: false, invalidReason, payer}` on rejection.
#[instrument(skip_all)]
pub async fn post_verify<A>(
    State(state): State<Arc<FacilitatorState<A>>>,
    headers: HeaderMap,
    Json(body): Json<proto::VerifyRequest>,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    if let Err(response) = assert_bearer(&headers, &state.api_key) {
        return response;
    }
    match state.facilitator.verify(&body).await {
        Ok(valid_response) => (StatusCode::OK, Json(valid_response)).into_response(),
        Err(error) => {
            tracing::warn!(
                error = ?error,
                body = %serde_json::to_string(&body).unwrap_or_else(|_| "<can-not-serialize>".to_string()),
                "Verification failed"
            );
            error.into_response()
        }
    }
}

/// `POST /settle`: facilitator-side execution of a verified payment.
///
/// Responds 200 with `{success: true, transaction, network, payer}` on
/// success, 4xx with `{success: false, errorReason, transaction, payer}`
/// on failure. Typically called after a successful `/verify`.
#[instrument(skip_all)]
pub async fn post_settle<A>(
    State(state): State<Arc<FacilitatorState<A>>>,
    headers: HeaderMap,
    Json(body): Json<proto::SettleRequest>,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    if let Err(response) = assert_bearer(&headers, &state.api_key) {
        return response;
    }
    match state.facilitator.settle(&body).await {
        Ok(valid_response) => (StatusCode::OK, Json(valid_response)).into_response(),
        Err(error) => {
            tracing::warn!(
                error = ?error,
                body = %serde_json::to_string(&body).unwrap_or_else(|_| "<can-not-serialize>".to_string()),
                "Settlement failed"
            );
            error.into_response()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationErrorResponse<'a> {
    is_valid: bool,
    invalid_reason: ErrorReason,
    invalid_reason_details: &'a str,
    payer: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementErrorResponse<'a> {
    success: bool,
    network: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<&'a str>,
    error_reason: &'a SettleErrorReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<&'a str>,
}

fn verification_error_response(
    status: StatusCode,
    reason: ErrorReason,
    details: &str,
) -> Response {
    let body = VerificationErrorResponse {
        is_valid: false,
        invalid_reason: reason,
        invalid_reason_details: details,
        payer: "",
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for FacilitatorLocalError {
    fn into_response(self) -> Response {
        match self {
            FacilitatorLocalError::MalformedRequest(details) => verification_error_response(
                StatusCode::BAD_REQUEST,
                ErrorReason::InvalidPayload,
                &details,
            ),
            FacilitatorLocalError::UnsupportedVersion(version) => verification_error_response(
                StatusCode::BAD_REQUEST,
                ErrorReason::InvalidX402Version,
                &format!("x402 version {version} is not supported"),
            ),
            FacilitatorLocalError::UnsupportedScheme(slug) => verification_error_response(
                StatusCode::BAD_REQUEST,
                ErrorReason::UnsupportedScheme,
                &format!("no scheme handler for {slug}"),
            ),
            FacilitatorLocalError::Verification(scheme_error) => {
                let status = match &scheme_error {
                    X402SchemeFacilitatorError::OnchainFailure(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    _ => StatusCode::BAD_REQUEST,
                };
                let problem = scheme_error.as_payment_problem();
                verification_error_response(status, problem.reason(), problem.details())
            }
            FacilitatorLocalError::Settlement(scheme_error) => match scheme_error {
                X402SchemeFacilitatorError::Settlement {
                    reason,
                    network,
                    transaction,
                    payer,
                } => {
                    let body = SettlementErrorResponse {
                        success: false,
                        network: &network,
                        transaction: transaction.as_deref(),
                        error_reason: &reason,
                        payer: payer.as_deref(),
                    };
                    (StatusCode::BAD_REQUEST, Json(body)).into_response()
                }
                X402SchemeFacilitatorError::PaymentVerification(e) => {
                    let problem = e.as_payment_problem();
                    verification_error_response(
                        StatusCode::BAD_REQUEST,
                        problem.reason(),
                        problem.details(),
                    )
                }
                X402SchemeFacilitatorError::OnchainFailure(details) => {
                    let body = SettlementErrorResponse {
                        success: false,
                        network: "",
                        transaction: None,
                        error_reason: &SettleErrorReason::Reason(
                            ErrorReason::UnexpectedSettleError,
                        ),
                        payer: None,
                    };
                    tracing::error!(details = %details, "settlement failed onchain");
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainId;
    use crate::proto::PaymentVerificationError;
    use crate::scheme::SchemeHandlerSlug;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn bearer_is_optional_when_unconfigured() {
        assert!(assert_bearer(&HeaderMap::new(), &None).is_ok());
    }

    #[test]
    fn configured_bearer_rejects_missing_header() {
        let expected = Some("sekrit".to_string());
        let denied = assert_bearer(&HeaderMap::new(), &expected).unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn configured_bearer_accepts_matching_token() {
        let expected = Some("sekrit".to_string());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer sekrit".parse().unwrap(),
        );
        assert!(assert_bearer(&headers, &expected).is_ok());
        headers.insert(
            header::AUTHORIZATION,
            "Bearer wrong".parse().unwrap(),
        );
        assert!(assert_bearer(&headers, &expected).is_err());
    }

    #[tokio::test]
    async fn verification_error_is_400_with_reason() {
        let error = FacilitatorLocalError::Verification(
            X402SchemeFacilitatorError::PaymentVerification(
                PaymentVerificationError::ValidBeforeTooSoon,
            ),
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["isValid"], false);
        assert_eq!(
            json["invalidReason"],
            "invalid_exact_evm_payload_authorization_valid_before"
        );
    }

    #[tokio::test]
    async fn settlement_error_keeps_transaction_hash() {
        let error = FacilitatorLocalError::Settlement(X402SchemeFacilitatorError::Settlement {
            reason: ErrorReason::InvalidTransactionState.into(),
            network: "eip155:56".to_string(),
            transaction: Some("0xdead".to_string()),
            payer: Some("0x34B72535f371dC25fFA8654A1b2A18bEaB91F510".to_string()),
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["transaction"], "0xdead");
        assert_eq!(json["errorReason"], "invalid_transaction_state");
    }

    #[tokio::test]
    async fn unsupported_scheme_maps_to_taxonomy() {
        let slug = SchemeHandlerSlug::new(ChainId::new("eip155", "196"), 2, "exact".to_string());
        let response = FacilitatorLocalError::UnsupportedScheme(slug).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["invalidReason"], "unsupported_scheme");
    }

    #[tokio::test]
    async fn onchain_failure_is_500() {
        let error = FacilitatorLocalError::Verification(
            X402SchemeFacilitatorError::OnchainFailure("rpc down".to_string()),
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
