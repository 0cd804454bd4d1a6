use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local view of the remote instance's connection lifecycle.
///
/// Unknown provider states always normalize to `Disconnected`; the local
/// record never carries a status outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[serde(rename = "NO_INSTANCE")]
    NoInstance,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
    #[serde(rename = "CONNECTING")]
    Connecting,
    #[serde(rename = "QRCODE")]
    QrCode,
    #[serde(rename = "PAIRING")]
    Pairing,
    #[serde(rename = "CONNECTED")]
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::NoInstance => "NO_INSTANCE",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::QrCode => "QRCODE",
            ConnectionStatus::Pairing => "PAIRING",
            ConnectionStatus::Connected => "CONNECTED",
        }
    }

    /// Parse a stored status string. Anything unrecognized maps to
    /// `Disconnected` rather than failing the read.
    pub fn parse(s: &str) -> Self {
        match s {
            "NO_INSTANCE" => ConnectionStatus::NoInstance,
            "CONNECTING" => ConnectionStatus::Connecting,
            "QRCODE" => ConnectionStatus::QrCode,
            "PAIRING" => ConnectionStatus::Pairing,
            "CONNECTED" => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature flags mirrored to the provider's per-instance settings.
/// Field names match the provider's settings payload (camelCase), so the
/// struct doubles as the `POST /settings/set` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsFlags {
    pub reject_call: bool,
    pub msg_call: String,
    pub groups_ignore: bool,
    pub always_online: bool,
    pub read_messages: bool,
    pub read_status: bool,
}

/// One logical session row per tenant. When legacy duplicate rows exist the
/// newest id wins (see `SessionStore::get`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub tenant_id: String,
    /// Instance name registered with the provider; empty means no instance
    /// has been provisioned for this tenant.
    pub session_name: String,
    pub status: ConnectionStatus,
    /// Tenant's WhatsApp number as a digit string. Back-filled from the
    /// provider-reported owner jid when not supplied directly.
    pub number: String,
    pub profile_name: String,
    pub profile_pic: String,
    pub profile_status: String,
    /// Last-issued QR payload as a data URI. Only trusted while `status`
    /// is `QrCode`; cleared on disconnect and successful connection.
    pub qr_code: String,
    #[serde(flatten)]
    pub settings: SettingsFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Empty record for a tenant with nothing provisioned. Not persisted;
    /// the store assigns the real id on first upsert.
    pub fn placeholder(tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: tenant_id.to_string(),
            session_name: String::new(),
            status: ConnectionStatus::NoInstance,
            number: String::new(),
            profile_name: String::new(),
            profile_pic: String::new(),
            profile_status: String::new(),
            qr_code: String::new(),
            settings: SettingsFlags::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ConnectionStatus::NoInstance,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::QrCode,
            ConnectionStatus::Pairing,
            ConnectionStatus::Connected,
        ] {
            assert_eq!(ConnectionStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_parses_to_disconnected() {
        assert_eq!(
            ConnectionStatus::parse("banned"),
            ConnectionStatus::Disconnected
        );
        assert_eq!(ConnectionStatus::parse(""), ConnectionStatus::Disconnected);
    }

    #[test]
    fn session_serializes_with_flattened_flags() {
        let mut session = Session::placeholder("t-1");
        session.settings.always_online = true;
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "NO_INSTANCE");
        assert_eq!(json["alwaysOnline"], true);
        assert_eq!(json["sessionName"], "");
    }
}
