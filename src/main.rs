//! Checkout service HTTP entrypoint.
//!
//! Wires the event log, bus, credential store, services, webhook delivery
//! engine, and background sweepers, then serves the API with graceful
//! shutdown on SIGTERM/SIGINT.

mod auth;
mod config;
mod credentials;
mod error;
mod event_bus;
mod event_store;
mod handlers;
mod services;
mod sig_down;
mod sweeper;
mod telemetry;
mod webhook_delivery;

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::config::Config;
use crate::credentials::InMemoryCredentialStore;
use crate::event_bus::{EventPublisher, InMemoryEventBus, TopicMap};
use crate::event_store::InMemoryEventStore;
use crate::handlers::AppState;
use crate::services::api_keys::ApiKeyService;
use crate::services::endpoints::{EndpointRegistry, WebhookEndpointService};
use crate::services::invoices::{InvoiceIndex, InvoiceService, RandomAddressAllocator};
use crate::services::matcher::MatcherService;
use crate::services::merchants::MerchantService;
use crate::services::payments::{PaymentIndex, PaymentService};
use crate::services::settlements::{SettlementIndex, SettlementService};
use crate::sig_down::SigDown;
use crate::sweeper::{LocalLease, Sweeper};
use crate::telemetry::Telemetry;
use crate::webhook_delivery::queue::InMemoryDeliveryQueue;
use crate::webhook_delivery::{DeliveryEngine, WebhookRouter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = Config::load()?;
    let _telemetry = Telemetry::init(config.log_level().as_filter());

    if config.database_url().is_some() {
        tracing::warn!(
            "database_url is set but this build ships the in-memory reference stores"
        );
    }
    if !config.brokers().is_empty() {
        tracing::warn!(
            "brokers are configured but this build ships the in-memory reference bus"
        );
    }

    let sig_down = SigDown::try_new()?;
    let http_cancel = sig_down.subsystem("http-server");
    let delivery_cancel = sig_down.subsystem("webhook-delivery");
    let sweeper_cancel = sig_down.subsystem("sweeper");

    // Read models, registered as projections so they update under the same
    // commit point as the log append.
    let invoice_index = Arc::new(InvoiceIndex::new());
    let payment_index = Arc::new(PaymentIndex::new());
    let settlement_index = Arc::new(SettlementIndex::new());
    let store = Arc::new(
        InMemoryEventStore::new()
            .with_projection(invoice_index.clone())
            .with_projection(payment_index.clone())
            .with_projection(settlement_index.clone()),
    );
    let bus = Arc::new(InMemoryEventBus::new());
    let credentials = Arc::new(InMemoryCredentialStore::new());

    // Webhook delivery: durable queues, per-endpoint serialized workers.
    let registry = Arc::new(EndpointRegistry::new());
    let delivery_queue = Arc::new(InMemoryDeliveryQueue::new());
    let delivery_engine = DeliveryEngine::new(
        delivery_queue.clone(),
        registry.clone(),
        store.clone(),
        config.webhook_workers(),
        delivery_cancel,
    );
    let router = WebhookRouter::new(
        registry.clone(),
        delivery_queue.clone(),
        delivery_engine.clone(),
    );

    let topics = TopicMap::standard().with_overrides(config.topics());
    let publisher = Arc::new(
        EventPublisher::new(store.clone(), bus, topics).with_consumer(Arc::new(router)),
    );

    let merchants = Arc::new(MerchantService::new(publisher.clone(), credentials.clone()));
    let api_keys = Arc::new(ApiKeyService::new(
        publisher.clone(),
        credentials.clone(),
        merchants.clone(),
    ));
    let invoices = Arc::new(InvoiceService::new(
        publisher.clone(),
        merchants.clone(),
        invoice_index.clone(),
        Arc::new(RandomAddressAllocator),
    ));
    let settlements = Arc::new(SettlementService::new(
        publisher.clone(),
        merchants.clone(),
        settlement_index,
    ));
    let matcher = Arc::new(MatcherService::new(
        publisher.clone(),
        invoices.clone(),
        settlements.clone(),
    ));
    let payments = Arc::new(PaymentService::new(
        publisher.clone(),
        payment_index,
        invoice_index,
        merchants.clone(),
        matcher,
    ));
    let endpoints = Arc::new(WebhookEndpointService::new(
        publisher.clone(),
        registry,
        merchants.clone(),
    ));
    let auth = Arc::new(AuthService::new(api_keys.clone(), config.jwt_secret()));

    // Deliveries interrupted by the previous shutdown resume now.
    delivery_engine.resume().await;

    let background = TaskTracker::new();
    let sweeper = Sweeper::new(
        invoices.clone(),
        payments.clone(),
        publisher.clone(),
        Arc::new(LocalLease),
        config.sweeper_interval(),
        config.confirmation_timeout(),
        config.outbox_batch(),
    );
    sweeper.spawn(&background, sweeper_cancel);
    background.close();

    let app_state = AppState {
        auth,
        merchants,
        api_keys,
        invoices,
        payments,
        settlements,
        endpoints,
        delivery_engine: delivery_engine.clone(),
        admin_token: config.admin_token().map(str::to_string),
    };
    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
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

    let axum_graceful_shutdown = async move { http_cancel.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    // Drain in-flight work within the grace period; unfinished deliveries
    // stay queued for the next startup.
    delivery_engine.shutdown(config.shutdown_grace()).await;
    background.wait().await;

    Ok(())
}
