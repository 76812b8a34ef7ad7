//! HTTP endpoints of the checkout service.
//!
//! Authenticated endpoints accept `Authorization: Bearer <credential>` where
//! the credential is a raw API key (identified by its `ck_live_`/`ck_test_`
//! prefix) or a JWT minted by the token exchange. Administrative endpoints
//! (merchant management, key management, watcher intake) require the
//! configured admin bearer instead.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use checkout_types::api_key::{ApiKeyStatus, KeyType, PermissionSet};
use checkout_types::id::{ApiKeyId, EndpointId, InvoiceId, MerchantId};
use checkout_types::invoice::{Invoice, InvoiceStatus, NewInvoice};
use checkout_types::merchant::MerchantSettings;
use checkout_types::money::Money;
use checkout_types::payment::PaymentObserved;
use checkout_types::webhook::{EndpointConfig, WebhookEndpoint};

use crate::auth::{AuthContext, AuthService, TokenRequest, TokenResponse};
use crate::error::ApiError;
use crate::services::api_keys::ApiKeyService;
use crate::services::endpoints::WebhookEndpointService;
use crate::services::invoices::InvoiceService;
use crate::services::merchants::MerchantService;
use crate::services::payments::PaymentService;
use crate::services::settlements::SettlementService;
use crate::webhook_delivery::{DeliveryEngine, TestDeliveryResult};

/// Scopes checked by the API surface.
pub mod scopes {
    pub const INVOICES_READ: &str = "invoices:read";
    pub const INVOICES_WRITE: &str = "invoices:write";
    pub const WEBHOOKS_READ: &str = "webhooks:read";
    pub const WEBHOOKS_WRITE: &str = "webhooks:write";
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub merchants: Arc<MerchantService>,
    pub api_keys: Arc<ApiKeyService>,
    pub invoices: Arc<InvoiceService>,
    pub payments: Arc<PaymentService>,
    pub settlements: Arc<SettlementService>,
    pub endpoints: Arc<WebhookEndpointService>,
    pub delivery_engine: Arc<DeliveryEngine>,
    pub admin_token: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/v1/auth/token", post(post_token))
        .route("/api/v1/invoices", post(post_invoice))
        .route("/api/v1/invoices", get(get_invoices))
        .route("/api/v1/invoices/{id}", get(get_invoice))
        .route("/api/v1/invoices/{id}/cancel", post(post_invoice_cancel))
        .route("/invoice/{id}/status", get(get_public_invoice_status))
        .route("/api/v1/payments/observed", post(post_payment_observed))
        .route("/api/v1/merchants", post(post_merchant))
        .route("/api/v1/merchants/{id}", get(get_merchant))
        .route("/api/v1/merchants/{id}/activate", post(post_merchant_activate))
        .route("/api/v1/merchants/{id}/suspend", post(post_merchant_suspend))
        .route("/api/v1/merchants/{id}/close", post(post_merchant_close))
        .route("/api/v1/merchants/{id}/settings", put(put_merchant_settings))
        .route("/api/v1/merchant-api-keys/{merchant_id}", post(post_api_key))
        .route("/api/v1/merchant-api-keys/{merchant_id}", get(get_api_keys))
        .route(
            "/api/v1/merchant-api-keys/{merchant_id}/{key_id}",
            delete(delete_api_key),
        )
        .route("/api/v1/webhook-endpoints", post(post_endpoint))
        .route("/api/v1/webhook-endpoints", get(get_endpoints))
        .route("/api/v1/webhook-endpoints/{id}", get(get_endpoint))
        .route("/api/v1/webhook-endpoints/{id}", put(put_endpoint))
        .route("/api/v1/webhook-endpoints/{id}", delete(delete_endpoint))
        .route("/api/v1/webhook-endpoints/{id}/test", post(post_endpoint_test))
        .route("/api/v1/webhook-endpoints/{id}/enable", post(post_endpoint_enable))
        .route(
            "/api/v1/webhook-endpoints/{id}/disable",
            post(post_endpoint_disable),
        )
}

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(ApiError::authentication)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let bearer = bearer(headers)?;
    Ok(state.auth.authenticate(bearer).await?)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = bearer(headers)?;
    match state.admin_token.as_deref() {
        Some(expected) if presented == expected => Ok(()),
        _ => Err(ApiError::authentication()),
    }
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /api/v1/auth/token`: exchanges an API key for a scoped bearer token.
#[instrument(skip_all)]
async fn post_token(
    State(state): State<AppState>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    Ok(Json(state.auth.exchange(body).await?))
}

/// `POST /api/v1/invoices`: creates an invoice for the authenticated merchant.
#[instrument(skip_all)]
async fn post_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewInvoice>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::INVOICES_WRITE)?;
    let invoice = state.invoices.create(context.merchant_id, body).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

#[derive(Debug, Deserialize)]
struct ListInvoicesParams {
    #[serde(default)]
    status: Option<InvoiceStatus>,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct ListInvoicesResponse {
    invoices: Vec<Invoice>,
    total: usize,
    page: usize,
    limit: usize,
}

/// `GET /api/v1/invoices`: newest-first page of the merchant's invoices.
#[instrument(skip_all)]
async fn get_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListInvoicesParams>,
) -> Result<Json<ListInvoicesResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::INVOICES_READ)?;
    let page = state
        .invoices
        .list(context.merchant_id, params.status, params.page, params.limit)
        .await?;
    Ok(Json(ListInvoicesResponse {
        invoices: page.invoices,
        total: page.total,
        page: page.page,
        limit: page.limit,
    }))
}

#[derive(Debug, Serialize)]
struct MerchantInvoiceResponse {
    #[serde(flatten)]
    invoice: Invoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    settlement: Option<checkout_types::settlement::Settlement>,
}

/// `GET /api/v1/invoices/{id}`: merchant view, settlement attached once
/// present.
#[instrument(skip_all)]
async fn get_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
) -> Result<Json<MerchantInvoiceResponse>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::INVOICES_READ)?;
    let invoice = state
        .invoices
        .get_for_merchant(id, context.merchant_id)
        .await?;
    let settlement = state.settlements.for_invoice(id).await?;
    Ok(Json(MerchantInvoiceResponse {
        invoice,
        settlement,
    }))
}

#[derive(Debug, Deserialize)]
struct CancelInvoiceRequest {
    #[serde(default = "default_cancel_reason")]
    reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by merchant".to_string()
}

/// `POST /api/v1/invoices/{id}/cancel`
#[instrument(skip_all)]
async fn post_invoice_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
    Json(body): Json<CancelInvoiceRequest>,
) -> Result<Json<Invoice>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::INVOICES_WRITE)?;
    let invoice = state
        .invoices
        .cancel(id, context.merchant_id, body.reason)
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Serialize)]
struct PublicInvoiceStatus {
    invoice_id: InvoiceId,
    status: InvoiceStatus,
    title: String,
    total: Money,
    crypto_amount: Money,
    paid_amount: Money,
    remaining: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_address: Option<String>,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paid_at: Option<DateTime<Utc>>,
}

/// `GET /invoice/{id}/status`: the public payment-page fetch. The first
/// fetch moves a fresh invoice from `created` to `pending`.
#[instrument(skip_all)]
async fn get_public_invoice_status(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<PublicInvoiceStatus>, ApiError> {
    let invoice = state.invoices.view(id).await?;
    Ok(Json(PublicInvoiceStatus {
        invoice_id: invoice.id,
        status: invoice.status,
        title: invoice.title.clone(),
        total: invoice.pricing.total,
        crypto_amount: invoice.crypto_amount,
        paid_amount: invoice.paid_amount,
        remaining: invoice.remaining(),
        payment_address: invoice.payment_address.clone(),
        expires_at: invoice.expires_at,
        paid_at: invoice.paid_at,
    }))
}

/// `POST /api/v1/payments/observed`: the blockchain watcher's intake.
#[instrument(skip_all)]
async fn post_payment_observed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PaymentObserved>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let payment = state.payments.observe(body).await?;
    Ok((StatusCode::ACCEPTED, Json(payment)))
}

#[derive(Debug, Deserialize)]
struct CreateMerchantRequest {
    business_name: String,
    contact_email: String,
    #[serde(default)]
    settings: Option<MerchantSettings>,
}

/// `POST /api/v1/merchants` (admin)
#[instrument(skip_all)]
async fn post_merchant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateMerchantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let merchant = state
        .merchants
        .create(
            body.business_name,
            body.contact_email,
            body.settings.unwrap_or_default(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(merchant)))
}

#[instrument(skip_all)]
async fn get_merchant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MerchantId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.merchants.get(id).await?))
}

#[instrument(skip_all)]
async fn post_merchant_activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MerchantId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.merchants.activate(id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct SuspendMerchantRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[instrument(skip_all)]
async fn post_merchant_suspend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MerchantId>,
    Json(body): Json<SuspendMerchantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.merchants.suspend(id, body.reason).await?))
}

#[instrument(skip_all)]
async fn post_merchant_close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MerchantId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.merchants.close(id).await?))
}

#[instrument(skip_all)]
async fn put_merchant_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<MerchantId>,
    Json(settings): Json<MerchantSettings>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.merchants.update_settings(id, settings).await?))
}

#[derive(Debug, Deserialize)]
struct CreateApiKeyRequest {
    key_type: KeyType,
    permissions: Vec<String>,
    name: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// API-key record without the digest.
#[derive(Debug, Serialize)]
struct ApiKeyResponse {
    id: ApiKeyId,
    merchant_id: MerchantId,
    key_type: KeyType,
    permissions: PermissionSet,
    status: ApiKeyStatus,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<checkout_types::api_key::ApiKey> for ApiKeyResponse {
    fn from(key: checkout_types::api_key::ApiKey) -> Self {
        ApiKeyResponse {
            id: key.id,
            merchant_id: key.merchant_id,
            key_type: key.key_type,
            permissions: key.permissions,
            status: key.status,
            name: key.name,
            expires_at: key.expires_at,
            last_used_at: key.last_used_at,
            created_at: key.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatedApiKeyResponse {
    api_key: ApiKeyResponse,
    /// Returned exactly once; never retrievable again.
    raw_key: String,
}

/// `POST /api/v1/merchant-api-keys/{merchant_id}` (admin)
#[instrument(skip_all)]
async fn post_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(merchant_id): Path<MerchantId>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let permissions = PermissionSet::new(body.permissions)
        .map_err(|e| ApiError::validation(e.to_string()).with_field("permissions"))?;
    let created = state
        .api_keys
        .create(merchant_id, body.key_type, permissions, body.name, body.expires_at)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedApiKeyResponse {
            api_key: created.key.into(),
            raw_key: created.raw_key,
        }),
    ))
}

/// `GET /api/v1/merchant-api-keys/{merchant_id}` (admin)
#[instrument(skip_all)]
async fn get_api_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(merchant_id): Path<MerchantId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let keys: Vec<ApiKeyResponse> = state
        .api_keys
        .list(merchant_id)
        .await?
        .into_iter()
        .map(ApiKeyResponse::from)
        .collect();
    Ok(Json(keys))
}

#[derive(Debug, Deserialize, Default)]
struct RevokeApiKeyRequest {
    #[serde(default = "default_revoke_reason")]
    reason: String,
}

fn default_revoke_reason() -> String {
    "revoked by administrator".to_string()
}

/// `DELETE /api/v1/merchant-api-keys/{merchant_id}/{key_id}` (admin)
#[instrument(skip_all)]
async fn delete_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((merchant_id, key_id)): Path<(MerchantId, ApiKeyId)>,
    Json(body): Json<RevokeApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let key = state.api_keys.get(key_id).await?;
    if key.merchant_id != merchant_id {
        return Err(crate::services::ServiceError::Authorization(
            "API key belongs to a different merchant".into(),
        )
        .into());
    }
    let revoked = state.api_keys.revoke(key_id, body.reason).await?;
    Ok(Json(ApiKeyResponse::from(revoked)))
}

/// Endpoint record without the signing secret.
#[derive(Debug, Serialize)]
struct EndpointResponse {
    id: EndpointId,
    merchant_id: MerchantId,
    url: url::Url,
    events: std::collections::BTreeSet<checkout_types::event::EventType>,
    status: checkout_types::webhook::EndpointStatus,
    max_retries: u32,
    retry_backoff: checkout_types::webhook::RetryBackoff,
    timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_ips: Option<Vec<String>>,
    headers: std::collections::BTreeMap<String, String>,
    consecutive_failures: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WebhookEndpoint> for EndpointResponse {
    fn from(endpoint: WebhookEndpoint) -> Self {
        EndpointResponse {
            id: endpoint.id,
            merchant_id: endpoint.merchant_id,
            url: endpoint.url,
            events: endpoint.events,
            status: endpoint.status,
            max_retries: endpoint.max_retries,
            retry_backoff: endpoint.retry_backoff,
            timeout_seconds: endpoint.timeout_seconds,
            allowed_ips: endpoint.allowed_ips,
            headers: endpoint.headers,
            consecutive_failures: endpoint.consecutive_failures,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }
}

/// `POST /api/v1/webhook-endpoints`
#[instrument(skip_all)]
async fn post_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EndpointConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    let endpoint = state.endpoints.create(context.merchant_id, body).await?;
    Ok((StatusCode::CREATED, Json(EndpointResponse::from(endpoint))))
}

/// `GET /api/v1/webhook-endpoints`
#[instrument(skip_all)]
async fn get_endpoints(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_READ)?;
    let endpoints: Vec<EndpointResponse> = state
        .endpoints
        .list(context.merchant_id)
        .await?
        .into_iter()
        .map(EndpointResponse::from)
        .collect();
    Ok(Json(endpoints))
}

#[instrument(skip_all)]
async fn get_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_READ)?;
    let endpoint = state.endpoints.get(id, context.merchant_id).await?;
    Ok(Json(EndpointResponse::from(endpoint)))
}

#[instrument(skip_all)]
async fn put_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
    Json(body): Json<EndpointConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    let endpoint = state.endpoints.update(id, context.merchant_id, body).await?;
    Ok(Json(EndpointResponse::from(endpoint)))
}

#[instrument(skip_all)]
async fn delete_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    state.endpoints.delete(id, context.merchant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/webhook-endpoints/{id}/test`: synchronous single-attempt
/// probe for configuration validation.
#[instrument(skip_all)]
async fn post_endpoint_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
) -> Result<Json<TestDeliveryResult>, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    let endpoint = state.endpoints.get(id, context.merchant_id).await?;
    Ok(Json(state.delivery_engine.test_delivery(&endpoint).await))
}

#[instrument(skip_all)]
async fn post_endpoint_enable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    let endpoint = state.endpoints.enable(id, context.merchant_id).await?;
    // Wake the endpoint's worker so the backlog drains immediately.
    state.delivery_engine.notify(endpoint.id);
    Ok(Json(EndpointResponse::from(endpoint)))
}

#[instrument(skip_all)]
async fn post_endpoint_disable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EndpointId>,
) -> Result<impl IntoResponse, ApiError> {
    let context = authenticate(&state, &headers).await?;
    context.require_scope(scopes::WEBHOOKS_WRITE)?;
    let endpoint = state.endpoints.disable(id, context.merchant_id).await?;
    Ok(Json(EndpointResponse::from(endpoint)))
}
