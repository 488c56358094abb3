//! Fire-and-forget settlement telemetry.
//!
//! Every sponsored settlement posts a JSON record to the scan endpoint. The
//! post runs on a background worker behind a bounded channel: a slow or dead
//! sink drops records, it never delays or fails a settlement.

use alloy_primitives::TxHash;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use crate::scheme::exact_evm::types::ExactPayment;

/// Default scan endpoint; overridable per scheme in configuration.
pub const DEFAULT_SCAN_URL: &str =
    "https://x402-scan-api.aeon.xyz/api/scan/manager/createTransaction";

/// Queue depth before records are dropped.
const SCAN_QUEUE_CAPACITY: usize = 64;

/// One settled payment, as reported to the scan service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
    pub asset: String,
    pub pay_to: String,
    pub amount: String,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub transaction: String,
    pub created_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Builds the record for a settled payment, stamped with the current time.
    pub fn for_settlement(payment: &ExactPayment, tx_hash: TxHash) -> Self {
        Self {
            from: payment.from.to_checksum(None),
            to: payment.to.to_checksum(None),
            value: payment.value.to_string(),
            valid_after: payment.valid_after.to_string(),
            valid_before: payment.valid_before.to_string(),
            nonce: payment.nonce.to_string(),
            asset: payment.asset.to_checksum(None),
            pay_to: payment.pay_to.to_checksum(None),
            amount: payment.required_amount.to_string(),
            network: payment.network.clone(),
            resource: payment.resource.clone(),
            transaction: tx_hash.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Handle to the background scan forwarder.
#[derive(Debug, Clone)]
pub struct ScanSink {
    tx: mpsc::Sender<ScanRecord>,
}

impl ScanSink {
    /// Spawns the forwarding worker. Must be called within a Tokio runtime.
    pub fn spawn(url: Url) -> Self {
        let (tx, mut rx) = mpsc::channel::<ScanRecord>(SCAN_QUEUE_CAPACITY);
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let result = client.post(url.clone()).json(&record).send().await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        tracing::trace!(transaction = %record.transaction, "scan record forwarded");
                    }
                    Ok(response) => {
                        tracing::warn!(
                            status = %response.status(),
                            transaction = %record.transaction,
                            "scan service rejected record"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = %error,
                            transaction = %record.transaction,
                            "scan record delivery failed"
                        );
                    }
                }
            }
        });
        Self { tx }
    }

    /// Enqueues a record. Drops it with a warning when the queue is full;
    /// the settlement result is never coupled to the sink.
    pub fn record(&self, record: ScanRecord) {
        if let Err(dropped) = self.tx.try_send(record) {
            tracing::warn!(error = %dropped, "scan record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::UnixTimestamp;
    use alloy_primitives::{Bytes, U256, address, b256};
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payment() -> ExactPayment {
        ExactPayment {
            asset: address!("0x55d398326f99059fF775485246999027B3197955"),
            from: address!("0x34b72535f371dc25ffa8654a1b2a18beab91f510"),
            to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            value: U256::from(1000u64),
            valid_after: UnixTimestamp(100),
            valid_before: UnixTimestamp(700),
            nonce: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            signature: Bytes::new(),
            pay_to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            required_amount: U256::from(1000u64),
            max_timeout_seconds: 300,
            eip712: None,
            network: "eip155:56".to_string(),
            resource: None,
        }
    }

    #[tokio::test]
    async fn record_is_forwarded_in_background() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let sink = ScanSink::spawn(server.uri().parse().unwrap());
        sink.record(ScanRecord::for_settlement(
            &payment(),
            b256!("0x2222222222222222222222222222222222222222222222222222222222222222"),
        ));
        // Fire-and-forget: poll the mock until the worker has delivered.
        for _ in 0..50 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scan record never arrived");
    }

    #[tokio::test]
    async fn sink_failure_never_surfaces() {
        // No server listening at all; recording must not error or panic.
        let sink = ScanSink::spawn("http://127.0.0.1:9".parse().unwrap());
        sink.record(ScanRecord::for_settlement(
            &payment(),
            b256!("0x2222222222222222222222222222222222222222222222222222222222222222"),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn record_wire_shape() {
        let payment = ExactPayment {
            asset: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            from: address!("0x34b72535f371dc25ffa8654a1b2a18beab91f510"),
            to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            value: U256::from(1000u64),
            valid_after: UnixTimestamp(100),
            valid_before: UnixTimestamp(700),
            nonce: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            signature: Bytes::new(),
            pay_to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            required_amount: U256::from(1000u64),
            max_timeout_seconds: 300,
            eip712: None,
            network: "eip155:56".to_string(),
            resource: Some("https://api.example.com/weather".to_string()),
        };
        let record = ScanRecord::for_settlement(
            &payment,
            b256!("0x2222222222222222222222222222222222222222222222222222222222222222"),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["value"], "1000");
        assert_eq!(json["validBefore"], "700");
        assert_eq!(json["network"], "eip155:56");
        assert_eq!(json["resource"], "https://api.example.com/weather");
        // RFC3339 timestamp
        let created_at = json["createdAt"].as_str().unwrap();
        assert!(created_at.contains('T'));
    }
}
