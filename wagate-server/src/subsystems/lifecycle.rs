//! Instance lifecycle control — create, recreate, connect, restart, logout,
//! delete, and settings pushes against the gateway provider.
//!
//! Each operation drives the session's status through the state machine and
//! persists at every transition. Fixed sleeps between provider calls await
//! provider-side propagation, not failure backoff; the only retries are the
//! explicitly bounded in-flow fallbacks.

use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use wagate_core::extract::{
    ensure_qr_data_uri, extract_pairing_code_deep, extract_qr_code, format_pairing_code,
    normalize_status, remote_connection_state,
};
use wagate_core::models::session::{ConnectionStatus, Session, SettingsFlags};
use wagate_core::{GatewayClient, GatewayResponse, SessionStore, WagateError};

use super::reconcile;

/// Calling-code prefix applied to numbers that arrive without one. Fixed
/// business rule, not configuration.
const HOME_COUNTRY_CODE: &str = "55";

/// Substitute for a blank instance name.
const DEFAULT_INSTANCE_NAME: &str = "wagate-default";

const MIN_INSTANCE_NAME_LEN: usize = 3;

/// Wait for provider-side propagation after create/teardown.
const PROVIDER_SETTLE: Duration = Duration::from_secs(2);

/// Delay before the single QR re-request when the first yields nothing.
const QR_RETRY_DELAY: Duration = Duration::from_millis(1500);

const RESTART_POLL_ATTEMPTS: u32 = 5;
const RESTART_POLL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMethod {
    QrCode,
    Pairing,
}

impl ConnectMethod {
    pub fn parse(method: &str) -> Result<Self, WagateError> {
        match method.trim().to_ascii_lowercase().as_str() {
            "qrcode" => Ok(ConnectMethod::QrCode),
            "pairing" => Ok(ConnectMethod::Pairing),
            other => Err(WagateError::Validation(format!(
                "unknown connect method '{other}', expected 'qrcode' or 'pairing'"
            ))),
        }
    }
}

/// Result of a connect/reconnect operation. The QR payload travels inside
/// the session; a pairing code is returned once and never persisted.
#[derive(Debug)]
pub struct ConnectResult {
    pub session: Session,
    pub pairing_code: Option<String>,
}

/// Strip everything but digits and prepend the home calling code when
/// absent. Empty input stays empty.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.starts_with(HOME_COUNTRY_CODE) {
        digits
    } else {
        format!("{HOME_COUNTRY_CODE}{digits}")
    }
}

/// Provision a fresh instance and request its QR or pairing secret.
pub async fn connect(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
    instance_name: &str,
    method: &str,
    phone_number: &str,
) -> Result<ConnectResult, WagateError> {
    let method = ConnectMethod::parse(method)?;
    let name = sanitize_instance_name(instance_name)?;
    let number = normalize_phone(phone_number);
    if method == ConnectMethod::Pairing && number.is_empty() {
        return Err(WagateError::Validation(
            "a phone number is required for the pairing method".to_string(),
        ));
    }

    create_instance(gateway, &name, &number, method).await?;

    let mut session = store
        .get(tenant_id)
        .await?
        .unwrap_or_else(|| Session::placeholder(tenant_id));
    session.session_name = name.clone();
    session.status = ConnectionStatus::Connecting;
    session.qr_code.clear();
    if !number.is_empty() {
        session.number = number.clone();
    }
    store.upsert(&session).await?;

    sleep(PROVIDER_SETTLE).await;

    issue_secret(store, gateway, session, method, &number).await
}

/// Re-establish a connection for an already provisioned tenant. Recreates
/// the remote instance when it is gone, short-circuits when already open.
pub async fn reconnect(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
    method: &str,
    phone_number: &str,
) -> Result<ConnectResult, WagateError> {
    let mut session = require_provisioned(store, tenant_id).await?;
    let method_parsed = ConnectMethod::parse(method)?;
    let name = session.session_name.clone();

    let mut number = normalize_phone(phone_number);
    if number.is_empty() {
        number = session.number.clone();
    } else {
        // A caller-supplied number replaces the stored one, same as on a
        // fresh connect.
        session.number = number.clone();
    }
    if method_parsed == ConnectMethod::Pairing && number.is_empty() {
        return Err(WagateError::Validation(
            "a phone number is required for the pairing method".to_string(),
        ));
    }

    let probe = gateway.fetch_instances(&name).await?;
    let remote_state = match probe.status {
        404 => None,
        _ if probe.is_success() => probe
            .json()
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .map(|first| normalize_status(&remote_connection_state(first))),
        _ => return Err(rejection(&probe)),
    };

    match remote_state {
        // The remote instance vanished; recreate it from scratch.
        None => connect(store, gateway, tenant_id, &name, method, &number).await,
        Some(ConnectionStatus::Connected) => {
            let session = reconcile::reconcile(store, gateway, tenant_id).await?;
            Ok(ConnectResult {
                session,
                pairing_code: None,
            })
        }
        Some(_) => issue_secret(store, gateway, session, method_parsed, &number).await,
    }
}

/// Logout, wait for the provider to report the instance down (bounded
/// polling), then request a fresh QR.
pub async fn restart(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
) -> Result<Session, WagateError> {
    let mut session = require_provisioned(store, tenant_id).await?;
    let name = session.session_name.clone();

    gateway.logout_instance(&name).await?;

    for _ in 0..RESTART_POLL_ATTEMPTS {
        sleep(RESTART_POLL_DELAY).await;
        match gateway.fetch_instances(&name).await {
            Ok(response) if response.status == 404 => break,
            Ok(response) if response.is_success() => {
                let still_open = response
                    .json()
                    .as_ref()
                    .and_then(Value::as_array)
                    .and_then(|items| items.first())
                    .map(|first| normalize_status(&remote_connection_state(first)))
                    .is_some_and(|status| status == ConnectionStatus::Connected);
                if !still_open {
                    break;
                }
            }
            // Transient; keep polling until the attempts run out.
            _ => {}
        }
    }

    let qr = request_qr(gateway, &name).await?;
    session.qr_code = ensure_qr_data_uri(&qr);
    session.status = ConnectionStatus::QrCode;
    store.upsert(&session).await?;
    Ok(session)
}

/// Log the instance out remotely (best-effort) and mark it disconnected.
pub async fn logout(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
) -> Result<Session, WagateError> {
    let mut session = require_provisioned(store, tenant_id).await?;
    if let Err(e) = gateway.logout_instance(&session.session_name).await {
        tracing::warn!(name = %session.session_name, error = %e, "logout call failed");
    }
    session.status = ConnectionStatus::Disconnected;
    session.qr_code.clear();
    store.upsert(&session).await?;
    Ok(session)
}

/// Tear the remote instance down (fire-and-forget) and remove the local
/// record.
pub async fn delete(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
) -> Result<(), WagateError> {
    let session = require_provisioned(store, tenant_id).await?;
    teardown(gateway, &session.session_name).await;
    store.clear(tenant_id).await
}

/// Push feature flags to the provider; persist them only on acceptance.
pub async fn update_settings(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
    flags: SettingsFlags,
) -> Result<Session, WagateError> {
    let mut session = require_provisioned(store, tenant_id).await?;
    let response = gateway.set_settings(&session.session_name, &flags).await?;
    if !response.is_success() {
        return Err(rejection(&response));
    }
    session.settings = flags;
    store.upsert(&session).await?;
    Ok(session)
}

// ============================================================================
// Internals
// ============================================================================

fn sanitize_instance_name(raw: &str) -> Result<String, WagateError> {
    let mut name: String = raw.split_whitespace().collect();
    if name.is_empty() {
        name = DEFAULT_INSTANCE_NAME.to_string();
    }
    if name.len() < MIN_INSTANCE_NAME_LEN {
        return Err(WagateError::Validation(format!(
            "instance name must be at least {MIN_INSTANCE_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

/// Create the named instance, tearing down a remote duplicate first — the
/// provider rejects duplicate names.
async fn create_instance(
    gateway: &GatewayClient,
    name: &str,
    number: &str,
    method: ConnectMethod,
) -> Result<(), WagateError> {
    if remote_instance_exists(gateway, name).await {
        tracing::info!(name, "instance name already taken remotely, recreating");
        teardown(gateway, name).await;
        sleep(PROVIDER_SETTLE).await;
    }

    let wants_qr = method == ConnectMethod::QrCode;
    let mut response = gateway.create_instance(name, number, wants_qr).await?;

    // Some provider versions answer 400/403 for a name that still lingers
    // after deletion; tear down once more and retry the create.
    if matches!(response.status, 400 | 403) {
        teardown(gateway, name).await;
        sleep(PROVIDER_SETTLE).await;
        response = gateway.create_instance(name, number, wants_qr).await?;
    }

    if !matches!(response.status, 200 | 201) {
        return Err(rejection(&response));
    }
    Ok(())
}

async fn remote_instance_exists(gateway: &GatewayClient, name: &str) -> bool {
    match gateway.fetch_instances(name).await {
        Ok(response) if response.is_success() => response
            .json()
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty()),
        // The probe is advisory; create errors surface on their own.
        _ => false,
    }
}

/// Best-effort logout + delete. Failures are logged, never propagated.
async fn teardown(gateway: &GatewayClient, name: &str) {
    if let Err(e) = gateway.logout_instance(name).await {
        tracing::debug!(name, error = %e, "teardown logout failed");
    }
    if let Err(e) = gateway.delete_instance(name).await {
        tracing::debug!(name, error = %e, "teardown delete failed");
    }
}

/// Request the method-specific secret and persist the resulting status.
/// On definitive failure the session stays at its last persisted status.
async fn issue_secret(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    mut session: Session,
    method: ConnectMethod,
    number: &str,
) -> Result<ConnectResult, WagateError> {
    match method {
        ConnectMethod::QrCode => {
            let qr = request_qr(gateway, &session.session_name).await?;
            session.qr_code = ensure_qr_data_uri(&qr);
            session.status = ConnectionStatus::QrCode;
            store.upsert(&session).await?;
            Ok(ConnectResult {
                session,
                pairing_code: None,
            })
        }
        ConnectMethod::Pairing => {
            let code = request_pairing(gateway, &session.session_name, number).await?;
            session.status = ConnectionStatus::Pairing;
            session.qr_code.clear();
            store.upsert(&session).await?;
            Ok(ConnectResult {
                session,
                pairing_code: Some(code),
            })
        }
    }
}

/// One connect call plus a single delayed retry; empty after both is a
/// definitive failure.
async fn request_qr(gateway: &GatewayClient, name: &str) -> Result<String, WagateError> {
    let response = gateway.connect_instance(name, None).await?;
    let mut qr = extract_qr_code(&response.body);
    if qr.is_empty() {
        sleep(QR_RETRY_DELAY).await;
        let response = gateway.connect_instance(name, None).await?;
        qr = extract_qr_code(&response.body);
    }
    if qr.is_empty() {
        return Err(WagateError::NoCode("QR code"));
    }
    Ok(qr)
}

/// Pairing-code fallback chain: connect-with-query, connect-with-body,
/// then the instance fetch in case the code is embedded there.
async fn request_pairing(
    gateway: &GatewayClient,
    name: &str,
    number: &str,
) -> Result<String, WagateError> {
    let response = gateway.connect_instance(name, Some(number)).await?;
    let mut code = extract_pairing_code_deep(&response.body);

    if code.is_empty() {
        let response = gateway.connect_with_number(name, number).await?;
        code = extract_pairing_code_deep(&response.body);
    }
    if code.is_empty() {
        let response = gateway.fetch_instances(name).await?;
        code = extract_pairing_code_deep(&response.body);
    }
    if code.is_empty() {
        return Err(WagateError::NoCode("pairing code"));
    }
    Ok(format_pairing_code(&code))
}

async fn require_provisioned(
    store: &dyn SessionStore,
    tenant_id: &str,
) -> Result<Session, WagateError> {
    store
        .get(tenant_id)
        .await?
        .filter(|session| !session.session_name.is_empty())
        .ok_or(WagateError::NotProvisioned)
}

/// Map a reachable-but-refusing provider response onto the error taxonomy,
/// pulling a human-readable detail out of the body when one exists.
fn rejection(response: &GatewayResponse) -> WagateError {
    let detail = response
        .json()
        .map(|body| rejection_detail(&body))
        .unwrap_or_default();
    WagateError::ProviderRejected {
        status: response.status,
        detail,
    }
}

fn rejection_detail(body: &Value) -> String {
    // Provider error bodies are not always structured; best-effort only.
    for key in ["message", "error"] {
        match body.get(key).or_else(|| body.get("response").and_then(|r| r.get(key))) {
            Some(Value::String(s)) => {
                if !s.is_empty() {
                    return s.clone();
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => return other.to_string(),
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_prepends_country_code() {
        assert_eq!(normalize_phone("11999998888"), "5511999998888");
        assert_eq!(normalize_phone("(11) 99999-8888"), "5511999998888");
    }

    #[test]
    fn test_normalize_phone_keeps_existing_country_code() {
        assert_eq!(normalize_phone("5511999998888"), "5511999998888");
        assert_eq!(normalize_phone("+55 11 99999 8888"), "5511999998888");
    }

    #[test]
    fn test_normalize_phone_empty_stays_empty() {
        assert_eq!(normalize_phone(""), "");
        assert_eq!(normalize_phone("abc"), "");
    }

    #[test]
    fn test_connect_method_parsing() {
        assert_eq!(ConnectMethod::parse("qrcode").unwrap(), ConnectMethod::QrCode);
        assert_eq!(ConnectMethod::parse(" Pairing ").unwrap(), ConnectMethod::Pairing);
        assert!(matches!(
            ConnectMethod::parse("sms"),
            Err(WagateError::Validation(_))
        ));
    }

    #[test]
    fn test_sanitize_instance_name() {
        assert_eq!(sanitize_instance_name("My Shop").unwrap(), "MyShop");
        assert_eq!(sanitize_instance_name("").unwrap(), DEFAULT_INSTANCE_NAME);
        assert!(matches!(
            sanitize_instance_name("ab"),
            Err(WagateError::Validation(_))
        ));
    }

    #[test]
    fn test_rejection_detail_shapes() {
        assert_eq!(
            rejection_detail(&serde_json::json!({"message": "name in use"})),
            "name in use"
        );
        assert_eq!(
            rejection_detail(&serde_json::json!({"error": "Forbidden"})),
            "Forbidden"
        );
        assert_eq!(
            rejection_detail(&serde_json::json!({"response": {"message": ["bad number"]}})),
            "[\"bad number\"]"
        );
        assert_eq!(rejection_detail(&serde_json::json!({"ok": true})), "");
    }
}
