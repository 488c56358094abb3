//! Axum middleware for enforcing x402 payments on protected routes.
//!
//! The middleware holds a [`RouteTable`] of `(method, path regex)` →
//! payment demands. Requests matching a gated route must carry a valid
//! payment header; everything else passes through untouched.
//!
//! Valid payments are verified with the configured facilitator before your
//! handler runs, and settled after it succeeds; the settlement receipt is
//! attached as the `X-PAYMENT-RESPONSE` header. Invalid or missing payments
//! get a `402 Payment Required` response carrying the accepted payment
//! list, as JSON or as a paywall page for browsers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use http::Method;
//! use aeon_x402::networks::USDC_BASE;
//! use aeon_x402_axum::layer::X402Middleware;
//! use aeon_x402_axum::routes::{RouteConfig, RouteTable};
//!
//! let routes = RouteTable::new()
//!     .add(
//!         Some(Method::GET),
//!         "/premium/.*",
//!         RouteConfig::price(
//!             USDC_BASE.parse("0.10").unwrap(),
//!             "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
//!         )
//!         .with_description("Premium content"),
//!     )
//!     .unwrap();
//!
//! let x402 = X402Middleware::try_from("https://facilitator.example/")
//!     .unwrap()
//!     .with_routes(routes)
//!     .with_base_url("https://api.example.com/".parse().unwrap());
//!
//! let app: Router = Router::new()
//!     .route("/premium/report", get(|| async { "paid content" }))
//!     .layer(x402);
//! ```
//!
//! ## Configuration notes
//!
//! - [`X402Middleware::with_base_url`] sets the public base used to build
//!   each requirement's `resource` URL from the request path. Without it the
//!   default is `http://localhost/`; set it in production.
//! - Route patterns are anchored regular expressions; the first match wins.

use axum_core::body::Body;
use axum_core::{extract::Request, response::Response};
use http::Uri;
use std::convert::Infallible;
use std::sync::Arc;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;

use aeon_x402::facilitator::Facilitator;
use aeon_x402::proto::v2;

use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError, FacilitatorConfig};
use crate::paygate::X402Paygate;
use crate::routes::{RouteConfig, RouteTable};

/// Middleware layer enforcing x402 payment verification and settlement.
#[derive(Debug)]
pub struct X402Middleware<F> {
    /// The facilitator used to verify and settle payments.
    facilitator: Arc<F>,
    /// Gated routes and their payment demands.
    routes: Arc<RouteTable>,
    /// Public base URL for computing per-request resource URLs.
    base_url: Option<Url>,
}

impl<F> Clone for X402Middleware<F> {
    fn clone(&self) -> Self {
        Self {
            facilitator: self.facilitator.clone(),
            routes: self.routes.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

impl TryFrom<&str> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let facilitator = FacilitatorClient::try_from(value)?;
        Ok(X402Middleware::new(facilitator))
    }
}

impl TryFrom<FacilitatorConfig> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: FacilitatorConfig) -> Result<Self, Self::Error> {
        let facilitator = FacilitatorClient::try_new(value)?;
        Ok(X402Middleware::new(facilitator))
    }
}

impl<F> X402Middleware<F> {
    pub fn new(facilitator: F) -> Self {
        Self {
            facilitator: Arc::new(facilitator),
            routes: Arc::new(RouteTable::new()),
            base_url: None,
        }
    }

    /// Replaces the route table.
    pub fn with_routes(&self, routes: RouteTable) -> Self {
        let mut this = self.clone();
        this.routes = Arc::new(routes);
        this
    }

    /// Sets the public base URL used to construct resource URLs.
    pub fn with_base_url(&self, base_url: Url) -> Self {
        let mut this = self.clone();
        this.base_url = Some(base_url);
        this
    }

    pub fn base_url(&self) -> Url {
        self.base_url
            .clone()
            .unwrap_or_else(|| Url::parse("http://localhost/").expect("valid literal"))
    }
}

impl<F> Clone for X402MiddlewareService<F> {
    fn clone(&self) -> Self {
        Self {
            facilitator: self.facilitator.clone(),
            routes: self.routes.clone(),
            base_url: self.base_url.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// Wraps the inner Axum service with payment enforcement.
pub struct X402MiddlewareService<F> {
    facilitator: Arc<F>,
    routes: Arc<RouteTable>,
    base_url: Url,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<S, F> Layer<S> for X402Middleware<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Clone,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        if self.base_url.is_none() {
            #[cfg(feature = "telemetry")]
            tracing::warn!(
                "X402Middleware base_url is not configured; defaulting to http://localhost/ for resource resolution"
            );
        }
        X402MiddlewareService {
            facilitator: self.facilitator.clone(),
            routes: self.routes.clone(),
            base_url: self.base_url(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    /// Delegates readiness polling to the wrapped inner service.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    /// Matches the request against the route table; gated requests go
    /// through the paygate, everything else is forwarded untouched.
    fn call(&mut self, req: Request) -> Self::Future {
        let Some(config) = self.routes.matching(req.method(), req.uri().path()) else {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(req).await });
        };
        let gate = X402Paygate {
            facilitator: self.facilitator.clone(),
            payment_requirements: effective_requirements(config, &self.base_url, req.uri()),
            resource: resource_info(config, &self.base_url, req.uri()),
        };
        let inner = self.inner.clone();
        Box::pin(gate.call(inner, req))
    }
}

/// The full resource URL of this request: the configured base plus the
/// request path and query.
fn resource_url(base_url: &Url, req_uri: &Uri) -> Url {
    let mut url = base_url.clone();
    url.set_path(req_uri.path());
    url.set_query(req_uri.query());
    url
}

/// Completes the route's requirement templates for one request: the
/// `resource` URL is filled in and display metadata is inherited from the
/// route where a requirement leaves it empty.
fn effective_requirements(
    config: &RouteConfig,
    base_url: &Url,
    req_uri: &Uri,
) -> Vec<v2::PaymentRequirements> {
    let resource = resource_url(base_url, req_uri);
    config
        .accepts
        .iter()
        .map(|template| {
            let mut requirement = template.clone();
            requirement.resource = Some(resource.clone());
            if requirement.description.is_empty() {
                requirement.description = config.description.clone();
            }
            if requirement.mime_type.is_none() {
                requirement.mime_type = config.mime_type.clone();
            }
            requirement
        })
        .collect()
}

fn resource_info(config: &RouteConfig, base_url: &Url, req_uri: &Uri) -> v2::ResourceInfo {
    v2::ResourceInfo {
        url: resource_url(base_url, req_uri).to_string(),
        description: config.description.clone(),
        mime_type: config
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/json".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteConfig;
    use aeon_x402::networks::USDC_BASE;

    #[test]
    fn resource_url_combines_base_path_and_query() {
        let base = Url::parse("https://api.example.com/").unwrap();
        let uri: Uri = "/premium/report?lang=en".parse().unwrap();
        let url = resource_url(&base, &uri);
        assert_eq!(url.as_str(), "https://api.example.com/premium/report?lang=en");
    }

    #[test]
    fn templates_inherit_route_metadata() {
        let config = RouteConfig::price(
            USDC_BASE.parse("0.10").unwrap(),
            "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
        )
        .with_description("Premium content")
        .with_mime_type("text/csv");
        let base = Url::parse("https://api.example.com/").unwrap();
        let uri: Uri = "/premium/report".parse().unwrap();
        let requirements = effective_requirements(&config, &base, &uri);
        assert_eq!(requirements.len(), 1);
        let requirement = &requirements[0];
        assert_eq!(
            requirement.resource.as_ref().unwrap().as_str(),
            "https://api.example.com/premium/report"
        );
        assert_eq!(requirement.description, "Premium content");
        assert_eq!(requirement.mime_type.as_deref(), Some("text/csv"));
    }

    #[test]
    fn requirement_accepts_entry_matches_selection_round_trip() {
        // The accepts list a 402 advertises must be the same entry the
        // middleware later matches the retried payment against.
        let config = RouteConfig::price(
            USDC_BASE.parse("0.10").unwrap(),
            "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
        );
        let base = Url::parse("https://api.example.com/").unwrap();
        let uri: Uri = "/premium".parse().unwrap();
        let advertised = effective_requirements(&config, &base, &uri);
        let again = effective_requirements(&config, &base, &uri);
        assert_eq!(advertised, again);
    }
}
