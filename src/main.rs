//! x402 facilitator HTTP entrypoint.
//!
//! Launches an Axum server exposing the facilitator interface for payment
//! verification and settlement on EVM networks.
//!
//! Endpoints:
//! - `GET /verify` – Verification request schema
//! - `POST /verify` – Verify a payment payload against requirements
//! - `GET /settle` – Settlement request schema
//! - `POST /settle` – Settle an accepted payment payload on-chain
//! - `GET|POST /supported` – Supported payment kinds and signer addresses
//! - `GET /health` – Liveness
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) selects the JSON configuration file
//! - `HOST`, `PORT` control the binding address
//! - `OTEL_*` variables enable tracing export

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use aeon_x402::chain::ChainRegistry;
use aeon_x402::config::Config;
use aeon_x402::facilitator_local::FacilitatorLocal;
use aeon_x402::handlers::{self, FacilitatorState};
use aeon_x402::scheme::{SchemeBlueprints, SchemeRegistry};
use aeon_x402::telemetry::Telemetry;
use aeon_x402::util::Shutdown;

/// Initializes the facilitator server.
///
/// Loads `.env`, sets up telemetry, connects chain providers, builds the
/// scheme registry, and serves until SIGTERM/SIGINT.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry =
        Telemetry::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")).register();

    let config = Config::load()?;

    let chain_registry = ChainRegistry::from_config(config.chains()).await?;
    let scheme_blueprints = SchemeBlueprints::full();
    let scheme_registry =
        SchemeRegistry::build(&chain_registry, scheme_blueprints, config.schemes());

    let facilitator = FacilitatorLocal::new(scheme_registry);
    let axum_state = Arc::new(FacilitatorState {
        facilitator,
        api_key: config.api_key(),
    });

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(axum_state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let shutdown = Shutdown::listen()?;
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { shutdown.requested().await })
        .await?;

    Ok(())
}
