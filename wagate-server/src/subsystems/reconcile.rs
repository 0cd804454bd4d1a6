//! Session reconciliation — converge the local record onto remote reality.
//!
//! One reconciliation pass fetches the named instance from the provider,
//! normalizes its connection state, merges profile fields (remote wins only
//! when non-empty), back-fills the number, persists, and — when connected —
//! pulls the remote feature settings. Convergence is best-effort: a provider
//! hiccup returns the stored record unchanged instead of failing the read.

use serde_json::Value;

use wagate_core::extract::{normalize_status, owner_number, remote_connection_state};
use wagate_core::models::session::{ConnectionStatus, Session, SettingsFlags};
use wagate_core::{GatewayClient, SessionStore, WagateError};

/// Synthetic avatar for connected sessions with no provider picture.
const AVATAR_URL_BASE: &str = "https://ui-avatars.com/api/?name=";

/// Reconcile the tenant's session with the provider and return the merged
/// record. Never contacts the provider when nothing is provisioned.
pub async fn reconcile(
    store: &dyn SessionStore,
    gateway: &GatewayClient,
    tenant_id: &str,
) -> Result<Session, WagateError> {
    let Some(mut session) = store.get(tenant_id).await? else {
        return Ok(Session::placeholder(tenant_id));
    };
    if session.session_name.is_empty() {
        session.status = ConnectionStatus::NoInstance;
        return Ok(session);
    }

    let response = match gateway.fetch_instances(&session.session_name).await {
        Ok(response) => response,
        Err(e) => {
            // Stale-but-available beats failing the caller's read.
            tracing::warn!(tenant_id, error = %e, "instance fetch unreachable, returning stored session");
            return Ok(session);
        }
    };

    if response.status == 404 {
        // The remote instance no longer exists.
        session.status = ConnectionStatus::Disconnected;
        session.qr_code.clear();
        store.upsert(&session).await?;
        return Ok(session);
    }

    if !response.is_success() {
        tracing::warn!(
            tenant_id,
            status = response.status,
            "instance fetch refused, returning stored session"
        );
        return Ok(session);
    }

    let body = response.json().unwrap_or(Value::Null);
    let Some(remote) = body.as_array().and_then(|items| items.first()) else {
        return Ok(session);
    };

    merge_remote(&mut session, remote);
    store.upsert(&session).await?;

    if session.status == ConnectionStatus::Connected {
        pull_settings(store, gateway, &mut session).await;
    }

    Ok(session)
}

/// Merge one fetched instance element into the session. Pure over the JSON
/// element so the merge rules are testable without a mock provider.
pub fn merge_remote(session: &mut Session, remote: &Value) {
    let normalized = normalize_status(&remote_connection_state(remote));
    // A bare poll cannot tell whether a QR or pairing code was issued; while
    // a connect operation has one pending, remote "connecting" must not
    // demote the secret-bearing local state.
    let status = match (normalized, session.status) {
        (ConnectionStatus::Connecting, ConnectionStatus::QrCode) => ConnectionStatus::QrCode,
        (ConnectionStatus::Connecting, ConnectionStatus::Pairing) => ConnectionStatus::Pairing,
        (normalized, _) => normalized,
    };

    let remote_name = remote_field(remote, &["profileName"]);
    if !remote_name.is_empty() {
        session.profile_name = remote_name;
    }
    let remote_pic = remote_field(remote, &["profilePicUrl", "profilePictureUrl"]);
    if !remote_pic.is_empty() {
        session.profile_pic = remote_pic;
    }
    let remote_about = remote_field(remote, &["profileStatus"]);
    if !remote_about.is_empty() {
        session.profile_status = remote_about;
    }

    if status == ConnectionStatus::Connected && session.profile_pic.is_empty() {
        session.profile_pic = format!("{AVATAR_URL_BASE}{}", session.session_name);
    }
    if session.profile_name.is_empty() {
        session.profile_name = session.session_name.clone();
    }

    let direct_number = remote_field(remote, &["number"]);
    if !direct_number.is_empty() {
        session.number = direct_number.chars().filter(|c| c.is_ascii_digit()).collect();
    } else {
        let jid = remote_field(remote, &["ownerJid", "owner"]);
        let from_jid = owner_number(&jid);
        if !from_jid.is_empty() {
            session.number = from_jid;
        }
    }

    session.status = status;
    if matches!(
        status,
        ConnectionStatus::Connected | ConnectionStatus::Disconnected
    ) {
        session.qr_code.clear();
    }
}

/// First non-empty value for any of `keys`, looked up at the element's top
/// level and under the legacy `instance` wrapper.
fn remote_field(remote: &Value, keys: &[&str]) -> String {
    for key in keys {
        for scope in [Some(remote), remote.get("instance")] {
            if let Some(value) = scope
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// Secondary settings fetch for connected sessions. Failures degrade the
/// returned flags but never undo the primary merge.
async fn pull_settings(store: &dyn SessionStore, gateway: &GatewayClient, session: &mut Session) {
    let response = match gateway.find_settings(&session.session_name).await {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            tracing::debug!(status = response.status, "settings find refused");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "settings find unreachable");
            return;
        }
    };

    let Some(body) = response.json() else { return };
    merge_flags(&mut session.settings, &body);
    if let Err(e) = store.upsert(session).await {
        tracing::warn!(error = %e, "failed to persist fetched settings");
    }
}

/// Overlay remote settings onto the stored flags, per key, tolerating a
/// `settings` wrapper object.
pub fn merge_flags(flags: &mut SettingsFlags, body: &Value) {
    let body = body.get("settings").unwrap_or(body);
    if let Some(v) = body.get("rejectCall").and_then(Value::as_bool) {
        flags.reject_call = v;
    }
    if let Some(v) = body.get("msgCall").and_then(Value::as_str) {
        flags.msg_call = v.to_string();
    }
    if let Some(v) = body.get("groupsIgnore").and_then(Value::as_bool) {
        flags.groups_ignore = v;
    }
    if let Some(v) = body.get("alwaysOnline").and_then(Value::as_bool) {
        flags.always_online = v;
    }
    if let Some(v) = body.get("readMessages").and_then(Value::as_bool) {
        flags.read_messages = v;
    }
    if let Some(v) = body.get("readStatus").and_then(Value::as_bool) {
        flags.read_status = v;
    }
}
