//! Paywall HTML for browser clients.
//!
//! Non-browser clients get the machine-readable 402 JSON body; browsers
//! (Accept: text/html plus a Mozilla user agent) get this page instead,
//! with the same payment data injected as `window.x402` so a wallet
//! extension or embedded script can drive the payment.

/// Marker replaced with the serialized `window.x402` configuration.
const CONFIG_SLOT: &str = "__X402_CONFIG__";

const PAYWALL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Payment Required</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            margin: 0;
            padding: 0;
            background: #10131a;
            color: #e8eaf0;
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
        }
        .container {
            background: #1a1f2b;
            border-radius: 12px;
            box-shadow: 0 20px 40px rgba(0,0,0,0.4);
            padding: 2rem;
            max-width: 480px;
            width: 90%;
            text-align: center;
        }
        h1 {
            margin-bottom: 0.5rem;
            font-size: 1.4rem;
        }
        .subtitle {
            color: #9aa3b5;
            margin-bottom: 1.5rem;
            line-height: 1.5;
        }
        .payment-info {
            background: #222838;
            border-radius: 8px;
            padding: 1rem;
            margin: 1rem 0;
            text-align: left;
        }
        .payment-row {
            display: flex;
            justify-content: space-between;
            margin-bottom: 0.5rem;
        }
        .payment-row:last-child { margin-bottom: 0; }
        .label { color: #9aa3b5; }
        .value { font-weight: 600; word-break: break-all; }
        .error {
            background: #3a1f24;
            color: #ff8a8a;
            padding: 0.75rem;
            border-radius: 6px;
            margin: 1rem 0;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Payment Required</h1>
        <div class="subtitle">
            This resource requires an x402 payment. Connect a compatible wallet and retry the request with a payment header.
        </div>
        <div id="payment-details" class="payment-info" style="display: none;">
            <div class="payment-row">
                <span class="label">Amount</span>
                <span class="value" id="amount"></span>
            </div>
            <div class="payment-row">
                <span class="label">Network</span>
                <span class="value" id="network"></span>
            </div>
            <div class="payment-row">
                <span class="label">Pay to</span>
                <span class="value" id="pay-to"></span>
            </div>
        </div>
        <div id="error-message" class="error" style="display: none;"></div>
    </div>
    <script>
        window.x402 = __X402_CONFIG__;
        document.addEventListener('DOMContentLoaded', function() {
            var config = window.x402 || {};
            var accepted = (config.accepts || [])[0];
            if (accepted) {
                document.getElementById('amount').textContent =
                    (accepted.amount || accepted.amountRequired || '?') + ' (atomic units)';
                document.getElementById('network').textContent = accepted.network || '';
                document.getElementById('pay-to').textContent = accepted.payTo || '';
                document.getElementById('payment-details').style.display = 'block';
            }
            if (config.error) {
                var err = document.getElementById('error-message');
                err.textContent = config.error;
                err.style.display = 'block';
            }
        });
    </script>
</body>
</html>"#;

/// Renders the paywall page with the given 402 payment data injected.
///
/// `config` must be valid JSON; it lands inside a `<script>` tag verbatim.
pub fn render(config: &serde_json::Value) -> String {
    PAYWALL_TEMPLATE.replace(CONFIG_SLOT, &config.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_config_json() {
        let html = render(&json!({
            "x402Version": 2,
            "error": "X-PAYMENT header is required",
            "accepts": []
        }));
        assert!(html.contains("window.x402 = {\""));
        assert!(html.contains("X-PAYMENT header is required"));
        assert!(!html.contains(CONFIG_SLOT));
    }
}
