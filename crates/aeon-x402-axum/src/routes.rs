//! Route table for payment-gated endpoints.
//!
//! The middleware holds a precompiled list of `(method, path regex)` →
//! [`RouteConfig`]. A request that matches no pattern passes through
//! untouched; a match gates the request behind the route's payment
//! requirements.

use http::Method;
use regex::Regex;

use aeon_x402::chain::eip155::{ChecksummedAddress, DeployedTokenAmount};
use aeon_x402::proto::v1::PaymentRequirementsExtra;
use aeon_x402::proto::v2::PaymentRequirements;
use aeon_x402::scheme::exact_evm::ExactScheme;

/// Matches requests by optional method verb and path regular expression.
///
/// The pattern is anchored on both ends, so `"/premium/.*"` does not match
/// `/api/premium/x`.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    method: Option<Method>,
    path: Regex,
}

impl RoutePattern {
    /// Compiles a pattern. `method: None` matches every verb.
    pub fn new(method: Option<Method>, path: &str) -> Result<Self, regex::Error> {
        let anchored = format!("^(?:{path})$");
        Ok(Self {
            method,
            path: Regex::new(&anchored)?,
        })
    }

    /// Whether the request line matches this pattern.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        self.path.is_match(path)
    }
}

/// Payment demands and display metadata of one gated route.
///
/// `accepts` holds requirement templates: full [`PaymentRequirements`]
/// whose `resource` is filled in per request from the request URL.
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    pub accepts: Vec<PaymentRequirements>,
    pub description: String,
    pub mime_type: Option<String>,
}

impl RouteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the accepted requirements.
    pub fn with_accepts<T: Into<Vec<PaymentRequirements>>>(mut self, accepts: T) -> Self {
        self.accepts = accepts.into();
        self
    }

    /// Adds one accepted requirement.
    pub fn or_accept(mut self, requirement: PaymentRequirements) -> Self {
        if !self.accepts.contains(&requirement) {
            self.accepts.push(requirement);
        }
        self
    }

    /// Sets the human-readable description shown to payers.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Sets the MIME type of the protected resource.
    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_type = Some(mime_type.to_string());
        self
    }

    /// Price shorthand: synthesizes a single requirement from a token
    /// amount and recipient.
    ///
    /// ```
    /// use aeon_x402::networks::USDC_BASE;
    /// use aeon_x402_axum::routes::RouteConfig;
    ///
    /// let config = RouteConfig::price(
    ///     USDC_BASE.parse("0.10").unwrap(),
    ///     "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
    /// );
    /// assert_eq!(config.accepts.len(), 1);
    /// ```
    pub fn price(amount: DeployedTokenAmount, pay_to: ChecksummedAddress) -> Self {
        let token = &amount.token;
        let requirement = PaymentRequirements {
            scheme: ExactScheme::VALUE.to_string(),
            network: token.chain_reference.as_chain_id(),
            network_id: Some(token.chain_reference.inner().to_string()),
            amount: Some(amount.amount.into()),
            amount_required: None,
            token_decimals: Some(token.decimals),
            pay_to,
            asset: token.address.into(),
            max_timeout_seconds: 300,
            extra: token.eip712.as_ref().map(|eip712| PaymentRequirementsExtra {
                name: eip712.name.clone(),
                version: eip712.version.clone(),
            }),
            resource: None,
            description: String::new(),
            mime_type: None,
        };
        Self::new().with_accepts(vec![requirement])
    }
}

/// The compiled route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<(RoutePattern, RouteConfig)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a gated route.
    pub fn add(
        mut self,
        method: Option<Method>,
        path: &str,
        config: RouteConfig,
    ) -> Result<Self, regex::Error> {
        let pattern = RoutePattern::new(method, path)?;
        self.routes.push((pattern, config));
        Ok(self)
    }

    /// The first route config matching the request line, in insertion order.
    pub fn matching(&self, method: &Method, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches(method, path))
            .map(|(_, config)| config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_x402::networks::USDC_BASE;

    fn pay_to() -> ChecksummedAddress {
        "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap()
    }

    #[test]
    fn pattern_is_anchored() {
        let pattern = RoutePattern::new(Some(Method::GET), "/premium/.*").unwrap();
        assert!(pattern.matches(&Method::GET, "/premium/report"));
        assert!(!pattern.matches(&Method::GET, "/api/premium/report"));
        assert!(!pattern.matches(&Method::POST, "/premium/report"));
    }

    #[test]
    fn verbless_pattern_matches_all_methods() {
        let pattern = RoutePattern::new(None, "/paid").unwrap();
        assert!(pattern.matches(&Method::GET, "/paid"));
        assert!(pattern.matches(&Method::POST, "/paid"));
    }

    #[test]
    fn first_matching_route_wins() {
        let table = RouteTable::new()
            .add(None, "/a", RouteConfig::new().with_description("first"))
            .unwrap()
            .add(None, "/.*", RouteConfig::new().with_description("catchall"))
            .unwrap();
        assert_eq!(table.matching(&Method::GET, "/a").unwrap().description, "first");
        assert_eq!(
            table.matching(&Method::GET, "/b").unwrap().description,
            "catchall"
        );
        assert!(table.matching(&Method::GET, "").is_none());
    }

    #[test]
    fn price_shorthand_synthesizes_requirement() {
        let config = RouteConfig::price(USDC_BASE.parse("0.10").unwrap(), pay_to());
        let requirement = &config.accepts[0];
        assert_eq!(requirement.scheme, "exact");
        assert_eq!(requirement.network.to_string(), "eip155:8453");
        assert_eq!(requirement.network_id.as_deref(), Some("8453"));
        assert_eq!(requirement.required_amount().unwrap().to_string(), "100000");
        assert_eq!(requirement.extra.as_ref().unwrap().name, "USD Coin");
    }
}
