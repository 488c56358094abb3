//! Tracing and OpenTelemetry setup.
//!
//! OTLP export activates when any of the standard `OTEL_*` environment
//! variables is present; otherwise only local `tracing-subscriber` fmt
//! logging is installed. Service identity (name, version, deployment
//! environment) is supplied by the caller so the resource attributes report
//! whichever binary embeds this crate, not a hardcoded constant.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider, Temporality},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use std::time::Duration;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OTLP transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    HttpProtobuf,
    Grpc,
}

impl OtlpProtocol {
    /// Parses an `OTEL_EXPORTER_OTLP_PROTOCOL` value. Unknown spellings
    /// fall back to HTTP, matching the exporter's own default.
    fn parse(value: &str) -> Self {
        match value {
            "grpc" => OtlpProtocol::Grpc,
            _ => OtlpProtocol::HttpProtobuf,
        }
    }

    /// `Some` when any OTLP configuration is present in the environment.
    fn from_env() -> Option<Self> {
        let configured = [
            "OTEL_EXPORTER_OTLP_ENDPOINT",
            "OTEL_EXPORTER_OTLP_HEADERS",
            "OTEL_EXPORTER_OTLP_PROTOCOL",
        ]
        .iter()
        .any(|var| env::var(var).is_ok());
        if !configured {
            return None;
        }
        let protocol = env::var("OTEL_EXPORTER_OTLP_PROTOCOL")
            .map(|value| Self::parse(&value))
            .unwrap_or(OtlpProtocol::HttpProtobuf);
        Some(protocol)
    }
}

/// Builder for the process-wide tracing and telemetry stack.
pub struct Telemetry {
    service_name: String,
    service_version: String,
    deployment_env: String,
}

impl Telemetry {
    /// Starts a builder with the given service identity.
    ///
    /// The deployment environment defaults to the `DEPLOYMENT_ENV` variable,
    /// falling back to `develop`.
    pub fn new(service_name: &str, service_version: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_version: service_version.to_string(),
            deployment_env: env::var("DEPLOYMENT_ENV")
                .unwrap_or_else(|_| "develop".to_string()),
        }
    }

    /// Overrides the deployment environment resource attribute.
    pub fn with_deployment_env(mut self, deployment_env: &str) -> Self {
        self.deployment_env = deployment_env.to_string();
        self
    }

    /// The OpenTelemetry resource describing this service.
    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, self.deployment_env.clone()),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    fn tracer_provider(&self, protocol: OtlpProtocol) -> SdkTracerProvider {
        let exporter = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::HttpProtobuf => exporter.with_http().build(),
            OtlpProtocol::Grpc => exporter.with_tonic().build(),
        }
        .expect("Failed to build OTLP span exporter");
        SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                1.0,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build()
    }

    fn meter_provider(&self, protocol: OtlpProtocol) -> SdkMeterProvider {
        let exporter = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::HttpProtobuf => exporter
                .with_http()
                .with_temporality(Temporality::default())
                .build(),
            OtlpProtocol::Grpc => exporter
                .with_tonic()
                .with_temporality(Temporality::default())
                .build(),
        }
        .expect("Failed to build OTLP metric exporter");
        let otlp_reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(30))
            .build();
        // A stdout reader alongside OTLP, for local inspection.
        let stdout_reader =
            PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build();
        let meter_provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(otlp_reader)
            .with_reader(stdout_reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        meter_provider
    }

    /// Installs the global tracing subscriber and returns a guard that
    /// flushes and shuts the providers down on drop.
    pub fn register(self) -> TelemetryGuard {
        match OtlpProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = self.tracer_provider(protocol);
                let meter_provider = self.meter_provider(protocol);
                let tracer = tracer_provider.tracer("tracing-otel-subscriber");
                // The INFO-level filter keeps the exporter's own network
                // stack from reentering the OpenTelemetry layer with its
                // spans while exporting.
                tracing_subscriber::registry()
                    .with(tracing_subscriber::filter::LevelFilter::INFO)
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();
                tracing::info!(protocol = ?protocol, "OpenTelemetry export enabled");
                TelemetryGuard {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                tracing::info!("OpenTelemetry is not enabled");
                TelemetryGuard {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

/// Keeps the installed providers alive for the process lifetime.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_spellings() {
        assert_eq!(OtlpProtocol::parse("grpc"), OtlpProtocol::Grpc);
        assert_eq!(OtlpProtocol::parse("http/protobuf"), OtlpProtocol::HttpProtobuf);
        assert_eq!(OtlpProtocol::parse("http"), OtlpProtocol::HttpProtobuf);
        assert_eq!(OtlpProtocol::parse("carrier-pigeon"), OtlpProtocol::HttpProtobuf);
    }

    #[test]
    fn deployment_env_override() {
        let telemetry = Telemetry::new("aeon-x402", "0.0.0").with_deployment_env("production");
        assert_eq!(telemetry.deployment_env, "production");
    }
}
