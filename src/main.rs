//! x402-gate HTTP entrypoint.
//!
//! Runs the facilitator over HTTP and, when configured, a paid resource behind the paygate.
//!
//! Endpoints:
//! - `GET /verify` – Verification request schema
//! - `POST /verify` – Verify a payment payload against requirements
//! - `GET /settle` – Settlement request schema
//! - `POST /settle` – Settle an accepted payment payload on-chain
//! - `GET /supported` – Supported payment kinds and signer addresses
//! - `GET /health` – Same as `/supported`
//! - `GET|POST <paygate.path>` – The paid resource, if `paygate` is configured
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `CONFIG` points at the configuration file
//! - `OTEL_*` variables enable trace and metric export

use axum::http::Method;
use axum::routing::get;
use axum::{Extension, Json, Router};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use x402_gate::config::Config;
use x402_gate::facilitator_local::FacilitatorService;
use x402_gate::handlers;
use x402_gate::networks::NetworkRegistry;
use x402_gate::paygate::{Paygate, PaymentReceipt};
use x402_gate::util::{SigDown, Telemetry};

async fn paid_resource(Extension(receipt): Extension<PaymentReceipt>) -> Json<PaymentReceipt> {
    Json(receipt)
}

/// Initializes the server.
///
/// - Loads `.env` variables.
/// - Initializes OpenTelemetry tracing.
/// - Connects to the configured networks.
/// - Serves until SIGTERM or SIGINT.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| "Failed to initialize rustls crypto provider")?;

    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let registry = Arc::new(NetworkRegistry::with_custom(
        config.custom_networks().to_vec(),
    ));

    let facilitator = Arc::new(FacilitatorService::from_config(&config, registry.clone())?);
    tracing::info!(facilitator = ?facilitator, "Facilitator ready");

    let mut http_endpoints = Router::new().merge(handlers::routes().with_state(facilitator.clone()));
    if let Some(paygate_config) = config.paygate() {
        let paygate = Arc::new(Paygate::from_config(
            paygate_config,
            registry.clone(),
            &facilitator,
        )?);
        tracing::info!(path = %paygate_config.path, accepts = ?paygate.accepts(), "Paygate enabled");
        let paid = Router::new().route(
            &paygate_config.path,
            get(paid_resource).post(paid_resource),
        );
        http_endpoints = http_endpoints.merge(paygate.protect(paid));
    }
    let http_endpoints = http_endpoints.layer(telemetry.http_tracing()).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
