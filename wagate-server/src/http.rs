//! Wagate HTTP REST API
//!
//! Axum-based shell around the reconciliation and lifecycle subsystems.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to an
//! inner function. The inner functions are directly testable without axum
//! dispatch machinery.
//!
//! Endpoints:
//! - GET  /health             — health check with DB status
//! - GET  /version            — server version info
//! - GET  /whatsapp           — reconciled session status
//! - POST /whatsapp/connect   — provision an instance, get QR/pairing code
//! - POST /whatsapp/reconnect — re-issue connect for an existing instance
//! - POST /whatsapp/restart   — logout + fresh QR
//! - POST /whatsapp/logout    — remote logout, local DISCONNECTED
//! - POST /whatsapp/delete    — tear down instance, remove record
//! - PUT  /whatsapp/settings  — push feature flags to the provider
//!
//! Tenant identity arrives in the `x-tenant-id` header, injected by the
//! auth layer that fronts this service.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use wagate_core::models::session::SettingsFlags;
use wagate_core::{GatewayClient, SessionStore, WagateError};

use crate::locks::TenantLocks;
use crate::subsystems::{lifecycle, reconcile};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub gateway: Arc<GatewayClient>,
    pub locks: Arc<TenantLocks>,
    /// Present when backed by Postgres; `None` for the in-memory store.
    pub pool: Option<PgPool>,
}

/// Build the axum router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/whatsapp", get(status_handler))
        .route("/whatsapp/connect", post(connect_handler))
        .route("/whatsapp/reconnect", post(reconnect_handler))
        .route("/whatsapp/restart", post(restart_handler))
        .route("/whatsapp/logout", post(logout_handler))
        .route("/whatsapp/delete", post(delete_handler))
        .route("/whatsapp/settings", put(settings_handler))
        .with_state(state)
}

/// Start the HTTP server on the given address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    addr: String,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Wagate HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

/// Authenticated tenant, extracted from the `x-tenant-id` header.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| TenantId(value.to_string()))
            .ok_or((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("missing x-tenant-id header")),
            ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub instance_name: String,
    pub method: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectRequest {
    pub method: String,
    #[serde(default)]
    pub phone_number: String,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — reports DB reachability (or the memory backend).
pub async fn health_inner(pool: Option<&PgPool>) -> (StatusCode, serde_json::Value) {
    let database = match pool {
        Some(pool) => match wagate_core::db::health_check(pool).await {
            Ok(version) => version,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "status": "unhealthy",
                        "error": e.to_string(),
                    }),
                );
            }
        },
        None => "memory".to_string(),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
        }),
    )
}

/// Inner version — pure, no IO.
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "wagate/1",
    })
}

/// Inner status read — one reconciliation pass under the tenant lock.
pub async fn status_inner(state: &AppState, tenant_id: &str) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    match reconcile::reconcile(state.store.as_ref(), &state.gateway, tenant_id).await {
        Ok(session) => (StatusCode::OK, session_body(&session)),
        Err(e) => error_response(&e),
    }
}

/// Inner connect — full provisioning flow under the tenant lock.
pub async fn connect_inner(
    state: &AppState,
    tenant_id: &str,
    req: ConnectRequest,
) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    let result = lifecycle::connect(
        state.store.as_ref(),
        &state.gateway,
        tenant_id,
        &req.instance_name,
        &req.method,
        &req.phone_number,
    )
    .await;

    match result {
        Ok(outcome) => (StatusCode::OK, connect_body(&outcome)),
        Err(e) => error_response(&e),
    }
}

pub async fn reconnect_inner(
    state: &AppState,
    tenant_id: &str,
    req: ReconnectRequest,
) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    let result = lifecycle::reconnect(
        state.store.as_ref(),
        &state.gateway,
        tenant_id,
        &req.method,
        &req.phone_number,
    )
    .await;

    match result {
        Ok(outcome) => (StatusCode::OK, connect_body(&outcome)),
        Err(e) => error_response(&e),
    }
}

pub async fn restart_inner(state: &AppState, tenant_id: &str) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    match lifecycle::restart(state.store.as_ref(), &state.gateway, tenant_id).await {
        Ok(session) => (StatusCode::OK, session_body(&session)),
        Err(e) => error_response(&e),
    }
}

pub async fn logout_inner(state: &AppState, tenant_id: &str) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    match lifecycle::logout(state.store.as_ref(), &state.gateway, tenant_id).await {
        Ok(session) => (StatusCode::OK, session_body(&session)),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_inner(state: &AppState, tenant_id: &str) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    match lifecycle::delete(state.store.as_ref(), &state.gateway, tenant_id).await {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({ "status": "ok", "message": "instance deleted" }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn settings_inner(
    state: &AppState,
    tenant_id: &str,
    flags: SettingsFlags,
) -> (StatusCode, serde_json::Value) {
    let lock = state.locks.for_tenant(tenant_id).await;
    let _guard = lock.lock().await;

    match lifecycle::update_settings(state.store.as_ref(), &state.gateway, tenant_id, flags).await {
        Ok(session) => (StatusCode::OK, session_body(&session)),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = health_inner(state.pool.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn status_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> impl IntoResponse {
    let (status, body) = status_inner(&state, &tenant_id).await;
    (status, Json(body))
}

pub async fn connect_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(req): Json<ConnectRequest>,
) -> impl IntoResponse {
    let (status, body) = connect_inner(&state, &tenant_id, req).await;
    (status, Json(body))
}

pub async fn reconnect_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(req): Json<ReconnectRequest>,
) -> impl IntoResponse {
    let (status, body) = reconnect_inner(&state, &tenant_id, req).await;
    (status, Json(body))
}

pub async fn restart_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> impl IntoResponse {
    let (status, body) = restart_inner(&state, &tenant_id).await;
    (status, Json(body))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> impl IntoResponse {
    let (status, body) = logout_inner(&state, &tenant_id).await;
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state, &tenant_id).await;
    (status, Json(body))
}

pub async fn settings_handler(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(flags): Json<SettingsFlags>,
) -> impl IntoResponse {
    let (status, body) = settings_inner(&state, &tenant_id, flags).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

fn session_body(session: &wagate_core::Session) -> serde_json::Value {
    serde_json::to_value(session).unwrap_or_else(|_| serde_json::json!({}))
}

fn connect_body(outcome: &lifecycle::ConnectResult) -> serde_json::Value {
    let mut body = serde_json::json!({
        "status": outcome.session.status,
        "instance": outcome.session.session_name,
    });
    if !outcome.session.qr_code.is_empty() {
        body["qrCode"] = serde_json::Value::String(outcome.session.qr_code.clone());
    }
    if let Some(code) = &outcome.pairing_code {
        body["pairingCode"] = serde_json::Value::String(code.clone());
        body["message"] = serde_json::Value::String(
            "Enter the code on your phone: Linked Devices > Link a Device > Link with phone number"
                .to_string(),
        );
    }
    body
}

/// Map the error taxonomy onto HTTP statuses.
pub fn error_response(err: &WagateError) -> (StatusCode, serde_json::Value) {
    let status = match err {
        WagateError::Validation(_) | WagateError::NotProvisioned => StatusCode::BAD_REQUEST,
        WagateError::ProviderRejected { .. } => StatusCode::BAD_REQUEST,
        WagateError::NoCode(_) => StatusCode::BAD_GATEWAY,
        WagateError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        WagateError::Database(_) | WagateError::Config(_) | WagateError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        serde_json::json!({
            "error": err.to_string(),
            "status": "error",
        }),
    )
}

// ============================================================================
// Unit Tests — inner functions and pure helpers
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wagate_core::gateway::GatewayError;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "wagate/1", "protocol must be wagate/1");
    }

    #[tokio::test]
    async fn test_health_inner_without_pool_reports_memory() {
        let (status, body) = health_inner(None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "memory");
    }

    #[test]
    fn test_error_response_mapping() {
        let (status, body) = error_response(&WagateError::Validation("bad".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, _) = error_response(&WagateError::NotProvisioned);
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(&WagateError::ProviderRejected {
            status: 403,
            detail: "name in use".to_string(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(&WagateError::NoCode("QR code"));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_error_response_provider_unreachable_maps_to_503() {
        // Minting a real transport error needs an actual failed dial.
        let config = wagate_core::config::GatewayConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: String::new(),
            timeout_secs: 1,
        };
        let client = wagate_core::GatewayClient::new(&config).unwrap();
        let err: GatewayError = client.fetch_instances("x").await.unwrap_err();
        let (status, body) = error_response(&WagateError::ProviderUnavailable(err));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("unreachable"));
    }
}
