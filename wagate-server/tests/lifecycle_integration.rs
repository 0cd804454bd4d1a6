//! End-to-end lifecycle tests against a wiremock gateway provider.
//!
//! These run the real lifecycle controller with the in-memory session store,
//! so they cover the full provider call sequences (probe, create, connect,
//! teardown) including the fixed propagation sleeps — expect a couple of
//! seconds per connect flow.

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wagate_core::config::GatewayConfig;
use wagate_core::models::session::{ConnectionStatus, Session, SettingsFlags};
use wagate_core::{GatewayClient, MemorySessionStore, SessionStore, WagateError};
use wagate_server::subsystems::lifecycle;

const TENANT: &str = "tenant-1";

fn gateway_for(server: &MockServer) -> GatewayClient {
    let config = GatewayConfig {
        base_url: server.uri(),
        api_key: "test-key".to_string(),
        timeout_secs: 5,
    };
    GatewayClient::new(&config).unwrap()
}

fn long_qr_payload() -> String {
    "iVBORw0KGgoAAAANSUhEUgAA".repeat(5)
}

async fn seed_session(store: &MemorySessionStore, name: &str, status: ConnectionStatus) {
    let mut session = Session::placeholder(TENANT);
    session.session_name = name.to_string();
    session.status = status;
    store.upsert(&session).await.unwrap();
}

// ===========================================================================
// TEST: connect with method qrcode — create 201, QR extracted, data URI set
// ===========================================================================
#[tokio::test]
async fn test_connect_qrcode_end_to_end() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "instance": { "instanceName": "acme", "status": "created" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base64": long_qr_payload()
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::connect(&store, &gateway, TENANT, "acme", "qrcode", "11999998888")
        .await
        .unwrap();

    assert_eq!(outcome.session.status, ConnectionStatus::QrCode);
    assert!(outcome
        .session
        .qr_code
        .starts_with("data:image/png;base64,"));
    assert!(outcome.pairing_code.is_none());

    let stored = store.get(TENANT).await.unwrap().unwrap();
    assert_eq!(stored.status, ConnectionStatus::QrCode);
    assert_eq!(stored.session_name, "acme");
    assert_eq!(stored.number, "5511999998888");
}

// ===========================================================================
// TEST: connect with method pairing — number normalized, code formatted
// ===========================================================================
#[tokio::test]
async fn test_connect_pairing_end_to_end() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .and(query_param("number", "5511999998888"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pairingCode": "WXYZ5678"
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::connect(&store, &gateway, TENANT, "acme", "pairing", "11999998888")
        .await
        .unwrap();

    assert_eq!(outcome.session.status, ConnectionStatus::Pairing);
    assert_eq!(outcome.pairing_code.as_deref(), Some("WXYZ-5678"));

    // The create payload must carry the normalized number.
    let requests = server.received_requests().await.unwrap();
    let create = requests
        .iter()
        .find(|r| r.url.path() == "/instance/create")
        .expect("create call missing");
    let body: serde_json::Value = serde_json::from_slice(&create.body).unwrap();
    assert_eq!(body["number"], "5511999998888");
    assert_eq!(body["qrcode"], false);
}

// ===========================================================================
// TEST: pairing falls back to the POST-with-body variant
// ===========================================================================
#[tokio::test]
async fn test_pairing_falls_back_to_post_variant() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&server)
        .await;
    // The GET connect variant yields nothing useful.
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 0 })))
        .mount(&server)
        .await;
    // The POST variant carries the code, nested the way newer providers do.
    Mock::given(method("POST"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instance": { "pairing": { "code": "QQQQ1111" } }
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::connect(&store, &gateway, TENANT, "acme", "pairing", "5511999998888")
        .await
        .unwrap();
    assert_eq!(outcome.pairing_code.as_deref(), Some("QQQQ-1111"));
}

// ===========================================================================
// TEST: duplicate remote instance is torn down before creation
// ===========================================================================
#[tokio::test]
async fn test_connect_recreates_duplicate_instance() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "instance": { "instanceName": "acme", "status": "close" } }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/instance/logout/acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/instance/delete/acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base64": long_qr_payload()
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::connect(&store, &gateway, TENANT, "acme", "qrcode", "")
        .await
        .unwrap();
    assert_eq!(outcome.session.status, ConnectionStatus::QrCode);
}

// ===========================================================================
// TEST: provider rejecting the create twice surfaces ProviderRejected
// ===========================================================================
#[tokio::test]
async fn test_connect_create_rejected() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": "Forbidden", "message": "name already in use"
        })))
        .mount(&server)
        .await;

    let err = lifecycle::connect(&store, &gateway, TENANT, "acme", "qrcode", "")
        .await
        .unwrap_err();
    match err {
        WagateError::ProviderRejected { status, detail } => {
            assert_eq!(status, 403);
            assert_eq!(detail, "name already in use");
        }
        other => panic!("expected ProviderRejected, got {other:?}"),
    }
}

// ===========================================================================
// TEST: no extractable QR after the bounded retry is definitive
// ===========================================================================
#[tokio::test]
async fn test_connect_qr_empty_after_retry_is_definitive() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/instance/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let err = lifecycle::connect(&store, &gateway, TENANT, "acme", "qrcode", "")
        .await
        .unwrap_err();
    assert!(matches!(err, WagateError::NoCode(_)));

    // Status stays at the last successful persist.
    let stored = store.get(TENANT).await.unwrap().unwrap();
    assert_eq!(stored.status, ConnectionStatus::Connecting);
}

// ===========================================================================
// TEST: reconnect without a provisioned session — no provider call made
// ===========================================================================
#[tokio::test]
async fn test_reconnect_unprovisioned_fails_before_any_call() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    let err = lifecycle::reconnect(&store, &gateway, TENANT, "qrcode", "")
        .await
        .unwrap_err();
    assert!(matches!(err, WagateError::NotProvisioned));
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ===========================================================================
// TEST: reconnect against an already-open instance just reconciles
// ===========================================================================
#[tokio::test]
async fn test_reconnect_already_open_reports_connected() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Disconnected).await;

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "connectionStatus": "open", "profileName": "Acme" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/settings/find/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "alwaysOnline": true
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::reconnect(&store, &gateway, TENANT, "qrcode", "")
        .await
        .unwrap();
    assert_eq!(outcome.session.status, ConnectionStatus::Connected);
    assert_eq!(outcome.session.profile_name, "Acme");
    assert!(outcome.session.settings.always_online);
}

// ===========================================================================
// TEST: reconnect re-issues the connect call when not open
// ===========================================================================
#[tokio::test]
async fn test_reconnect_reissues_qr_when_closed() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Disconnected).await;

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "connectionStatus": "close" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base64": long_qr_payload()
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::reconnect(&store, &gateway, TENANT, "qrcode", "")
        .await
        .unwrap();
    assert_eq!(outcome.session.status, ConnectionStatus::QrCode);
}

// ===========================================================================
// TEST: reconnect with a new number persists it alongside the re-issue
// ===========================================================================
#[tokio::test]
async fn test_reconnect_persists_caller_supplied_number() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    let mut session = Session::placeholder(TENANT);
    session.session_name = "acme".to_string();
    session.status = ConnectionStatus::Disconnected;
    session.number = "5511000000000".to_string();
    store.upsert(&session).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "connectionStatus": "close" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base64": long_qr_payload()
        })))
        .mount(&server)
        .await;

    let outcome = lifecycle::reconnect(&store, &gateway, TENANT, "qrcode", "11988887777")
        .await
        .unwrap();
    assert_eq!(outcome.session.number, "5511988887777");

    let stored = store.get(TENANT).await.unwrap().unwrap();
    assert_eq!(stored.number, "5511988887777");
}

// ===========================================================================
// TEST: restart — logout, poll until down, fresh QR
// ===========================================================================
#[tokio::test]
async fn test_restart_yields_fresh_qr() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Connected).await;

    Mock::given(method("DELETE"))
        .and(path("/instance/logout/acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/fetchInstances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "connectionStatus": "close" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base64": long_qr_payload()
        })))
        .mount(&server)
        .await;

    let session = lifecycle::restart(&store, &gateway, TENANT).await.unwrap();
    assert_eq!(session.status, ConnectionStatus::QrCode);
    assert!(session.qr_code.starts_with("data:image/png;base64,"));
}

// ===========================================================================
// TEST: logout — remote call best-effort, local row disconnected
// ===========================================================================
#[tokio::test]
async fn test_logout_marks_disconnected_and_clears_qr() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);

    let mut session = Session::placeholder(TENANT);
    session.session_name = "acme".to_string();
    session.status = ConnectionStatus::QrCode;
    session.qr_code = "data:image/png;base64,AAAA".to_string();
    store.upsert(&session).await.unwrap();

    Mock::given(method("DELETE"))
        .and(path("/instance/logout/acme"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let session = lifecycle::logout(&store, &gateway, TENANT).await.unwrap();
    assert_eq!(session.status, ConnectionStatus::Disconnected);
    assert!(session.qr_code.is_empty());
}

// ===========================================================================
// TEST: delete — teardown is fire-and-forget, record removed regardless
// ===========================================================================
#[tokio::test]
async fn test_delete_removes_record_even_if_teardown_fails() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Connected).await;

    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    lifecycle::delete(&store, &gateway, TENANT).await.unwrap();
    assert!(store.get(TENANT).await.unwrap().is_none());
}

// ===========================================================================
// TEST: settings update — persisted only on provider acceptance
// ===========================================================================
#[tokio::test]
async fn test_update_settings_persists_on_success() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Connected).await;

    Mock::given(method("POST"))
        .and(path("/settings/set/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let flags = SettingsFlags {
        reject_call: true,
        msg_call: "I do not take calls.".to_string(),
        always_online: true,
        ..Default::default()
    };
    let session = lifecycle::update_settings(&store, &gateway, TENANT, flags.clone())
        .await
        .unwrap();
    assert_eq!(session.settings, flags);

    let stored = store.get(TENANT).await.unwrap().unwrap();
    assert_eq!(stored.settings, flags);
}

#[tokio::test]
async fn test_update_settings_rejected_leaves_flags_unchanged() {
    let server = MockServer::start().await;
    let store = MemorySessionStore::new();
    let gateway = gateway_for(&server);
    seed_session(&store, "acme", ConnectionStatus::Connected).await;

    Mock::given(method("POST"))
        .and(path("/settings/set/acme"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "invalid settings"
        })))
        .mount(&server)
        .await;

    let flags = SettingsFlags {
        reject_call: true,
        ..Default::default()
    };
    let err = lifecycle::update_settings(&store, &gateway, TENANT, flags)
        .await
        .unwrap_err();
    assert!(matches!(err, WagateError::ProviderRejected { status: 400, .. }));

    let stored = store.get(TENANT).await.unwrap().unwrap();
    assert!(!stored.settings.reject_call);
}
