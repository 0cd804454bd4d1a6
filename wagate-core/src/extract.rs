//! Schema-drift-tolerant extraction of secrets and state from provider
//! responses.
//!
//! The provider has shipped several response shapes for the same endpoints
//! across versions. Everything here is a pure function over raw bytes or
//! parsed JSON: try a fixed list of paths in order, stop at the first hit,
//! and return an empty string when nothing matches. Callers treat empty as
//! "not yet available", never as an error.

use serde_json::Value;

use crate::models::session::ConnectionStatus;

/// Codes at or below this length are pairing codes; a `code` field longer
/// than this is assumed to be a QR payload.
pub const SHORT_CODE_MAX: usize = 16;

const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Ordered field fallback for the instance connection state. The provider
/// has used `connectionStatus`, `status` and `state`, at the top level or
/// nested under `instance`, depending on version.
const STATE_PATHS: &[&[&str]] = &[
    &["connectionStatus"],
    &["status"],
    &["state"],
    &["instance", "connectionStatus"],
    &["instance", "status"],
    &["instance", "state"],
];

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

/// Pull a QR payload out of a connect response.
///
/// Tries `base64`, then `code` (only when too long to be a pairing code),
/// then the nested `qrcode.base64` shape.
pub fn extract_qr_code(raw: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return String::new();
    };
    if let Some(b64) = str_at(&value, &["base64"]) {
        return b64.to_string();
    }
    if let Some(code) = str_at(&value, &["code"]) {
        if code.len() > SHORT_CODE_MAX {
            return code.to_string();
        }
    }
    if let Some(nested) = str_at(&value, &["qrcode", "base64"]) {
        return nested.to_string();
    }
    String::new()
}

/// Pull a pairing code out of a connect response (flat shapes only).
pub fn extract_pairing_code(raw: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return String::new();
    };
    flat_pairing_code(&value).unwrap_or_default()
}

/// Like [`extract_pairing_code`], but additionally walks arbitrarily nested
/// objects and arrays — including strings that are themselves JSON — looking
/// for `pairingCode`, `code`, `pin`, or a nested `pairing` object.
pub fn extract_pairing_code_deep(raw: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return String::new();
    };
    if let Some(code) = flat_pairing_code(&value) {
        return code;
    }
    walk_for_pairing_code(&value).unwrap_or_default()
}

fn flat_pairing_code(value: &Value) -> Option<String> {
    if let Some(code) = str_at(value, &["pairingCode"]) {
        return Some(code.to_string());
    }
    if let Some(code) = str_at(value, &["code"]) {
        if code.len() <= SHORT_CODE_MAX {
            return Some(code.to_string());
        }
    }
    None
}

fn walk_for_pairing_code(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["pairingCode", "code", "pin"] {
                if let Some(Value::String(s)) = map.get(key) {
                    if !s.is_empty() && s.len() <= SHORT_CODE_MAX {
                        return Some(s.clone());
                    }
                }
            }
            if let Some(pairing) = map.get("pairing") {
                if let Some(code) = walk_for_pairing_code(pairing) {
                    return Some(code);
                }
            }
            map.values().find_map(walk_for_pairing_code)
        }
        Value::Array(items) => items.iter().find_map(walk_for_pairing_code),
        // Some provider versions double-encode nested payloads.
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .as_ref()
            .and_then(walk_for_pairing_code),
        _ => None,
    }
}

/// Uppercase, trim, and hyphenate a pairing code the way the provider
/// displays it (`XXXX-XXXX` for separator-less 8-character codes).
pub fn format_pairing_code(raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == 8 && code.chars().all(|c| c.is_ascii_alphanumeric()) {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code
    }
}

/// Prefix a bare base64 QR payload with the PNG data-URI scheme. Payloads
/// that already carry an image data URI pass through untouched.
pub fn ensure_qr_data_uri(payload: &str) -> String {
    if payload.starts_with("data:image") {
        payload.to_string()
    } else {
        format!("{PNG_DATA_URI_PREFIX}{payload}")
    }
}

/// First non-empty connection-state string from the ordered field fallback
/// chain, lowercased. Empty when no known field is present.
pub fn remote_connection_state(instance: &Value) -> String {
    for path in STATE_PATHS {
        if let Some(state) = str_at(instance, path) {
            return state.trim().to_ascii_lowercase();
        }
    }
    String::new()
}

/// Map a provider-reported state onto the local status enum.
/// `open`/`connected` → Connected, `connecting` → Connecting, anything
/// else (including empty) → Disconnected.
pub fn normalize_status(state: &str) -> ConnectionStatus {
    match state.trim().to_ascii_lowercase().as_str() {
        "open" | "connected" => ConnectionStatus::Connected,
        "connecting" => ConnectionStatus::Connecting,
        _ => ConnectionStatus::Disconnected,
    }
}

/// Digits of the owner identifier before the first `@`
/// (`5511999998888@s.whatsapp.net` → `5511999998888`).
pub fn owner_number(jid: &str) -> String {
    jid.split('@')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}
