//! A [`Facilitator`] implementation backed by a _remote_ x402 facilitator
//! over HTTP.
//!
//! [`FacilitatorClient`] drives the `/verify`, `/settle`, and `/supported`
//! endpoints of a facilitator service. It is cheap to clone and shares a
//! connection pool via `reqwest::Client`, so one instance can serve many
//! routes and concurrent requests.
//!
//! A facilitator error response (4xx) still carries a well-formed JSON body
//! (`{isValid: false, ...}` / `{success: false, ...}`); the client parses it
//! into the typed response instead of failing, so the paygate sees the
//! reason rather than a bare status code.

use http::{HeaderMap, HeaderValue, StatusCode, header};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use aeon_x402::facilitator::Facilitator;
use aeon_x402::proto::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};

#[cfg(feature = "telemetry")]
use tracing::Instrument;

/// Connection settings of a remote facilitator: the base URL and an
/// optional API key presented as `Authorization: Bearer` on every call.
#[derive(Clone, Debug)]
pub struct FacilitatorConfig {
    pub url: Url,
    pub api_key: Option<String>,
}

impl FacilitatorConfig {
    /// Parses a base URL, normalizing the trailing slash.
    pub fn try_new(url: &str) -> Result<Self, FacilitatorClientError> {
        let mut normalized = url.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Ok(Self { url, api_key: None })
    }

    /// Attaches an API key.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }
}

/// A client for a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator (e.g. `https://facilitator.example/`)
    base_url: Url,
    /// Full URL for `POST /verify`
    verify_url: Url,
    /// Full URL for `POST /settle`
    settle_url: Url,
    /// Full URL for `POST /supported`
    supported_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    /// Headers sent with each request (the Bearer key lives here)
    headers: HeaderMap,
    /// Optional request timeout
    timeout: Option<Duration>,
}

/// Errors from the remote facilitator interaction.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid API key: not a valid header value")]
    InvalidApiKey,
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl FacilitatorClient {
    /// Constructs a client from connection settings.
    pub fn try_new(config: FacilitatorConfig) -> Result<Self, FacilitatorClientError> {
        let base_url = config.url;
        let verify_url = base_url
            .join("./verify")
            .map_err(|e| FacilitatorClientError::UrlParse {
                context: "Failed to construct ./verify URL",
                source: e,
            })?;
        let settle_url = base_url
            .join("./settle")
            .map_err(|e| FacilitatorClientError::UrlParse {
                context: "Failed to construct ./settle URL",
                source: e,
            })?;
        let supported_url =
            base_url
                .join("./supported")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./supported URL",
                    source: e,
                })?;
        let mut headers = HeaderMap::new();
        if let Some(api_key) = config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| FacilitatorClientError::InvalidApiKey)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            verify_url,
            settle_url,
            supported_url,
            headers,
            timeout: None,
        })
    }

    /// Returns the base URL used by this client.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sets a timeout for all future requests.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    /// Generic POST helper: JSON body, auth headers, timeout, and
    /// error-body-tolerant response parsing.
    ///
    /// `context` identifies the call in error messages (e.g. `"POST /verify"`).
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| FacilitatorClientError::ResponseBodyRead { context, source: e })?;

        // 4xx protocol errors carry the same response schema with
        // isValid/success false; parse those too.
        if status == StatusCode::OK || status.is_client_error() {
            serde_json::from_str::<R>(&body).map_err(|source| {
                FacilitatorClientError::JsonDeserialization { context, source }
            })
        } else {
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    /// Sends a `POST /verify` request to the facilitator.
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        let fut = self.post_json(&self.verify_url, "POST /verify", request);
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!("x402.facilitator_client.verify", timeout = ?self.timeout));
        fut.await
    }

    /// Sends a `POST /settle` request to the facilitator.
    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error> {
        let fut = self.post_json(&self.settle_url, "POST /settle", request);
        #[cfg(feature = "telemetry")]
        let fut = fut.instrument(tracing::info_span!("x402.facilitator_client.settle", timeout = ?self.timeout));
        fut.await
    }

    /// Sends a `POST /supported` request to the facilitator.
    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        self.post_json(&self.supported_url, "POST /supported", &serde_json::json!({}))
            .await
    }
}

/// Converts a string URL into a `FacilitatorClient` without an API key.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FacilitatorClient::try_new(FacilitatorConfig::try_new(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn urls_are_joined_from_base() {
        let client = FacilitatorClient::try_from("https://facilitator.example/x402").unwrap();
        assert_eq!(client.verify_url.as_str(), "https://facilitator.example/x402/verify");
        assert_eq!(client.settle_url.as_str(), "https://facilitator.example/x402/settle");
        assert_eq!(
            client.supported_url.as_str(),
            "https://facilitator.example/x402/supported"
        );
    }

    #[tokio::test]
    async fn verify_parses_error_body_on_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "isValid": false,
                "invalidReason": "insufficient_funds",
                "payer": ""
            })))
            .mount(&server)
            .await;
        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let request: VerifyRequest = json!({ "x402Version": 2 }).into();
        let response = client.verify(&request).await.unwrap();
        let typed: aeon_x402::proto::v1::VerifyResponse =
            serde_json::from_value(response.0).unwrap();
        assert!(matches!(
            typed,
            aeon_x402::proto::v1::VerifyResponse::Invalid { .. }
        ));
    }

    #[tokio::test]
    async fn bearer_key_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isValid": true,
                "payer": "0x34B72535f371dC25fFA8654A1b2A18bEaB91F510"
            })))
            .mount(&server)
            .await;
        let config = FacilitatorConfig::try_new(server.uri().as_str())
            .unwrap()
            .with_api_key("sekrit");
        let client = FacilitatorClient::try_new(config).unwrap();
        let request: VerifyRequest = json!({ "x402Version": 2 }).into();
        assert!(client.verify(&request).await.is_ok());
    }
}
