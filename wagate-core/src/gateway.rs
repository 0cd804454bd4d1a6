//! Low-level HTTP client for the WhatsApp gateway provider.
//!
//! `GatewayClient` wraps a single `reqwest::Client` with the provider base
//! URL, the `apikey` header, and a bounded timeout. A transport failure
//! (timeout, refused connection) is a `GatewayError`; a reachable provider
//! answering with a non-2xx status is a normal `GatewayResponse` — callers
//! decide what a given status means for their operation.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::models::session::SettingsFlags;

/// Longest response-body slice written to the debug log.
const LOG_BODY_MAX: usize = 512;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Raw provider reply: status code plus unparsed body bytes.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, or `None` if it is not valid JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Create a client against a custom base URL (for testing / integration).
    pub fn with_base_url(config: &GatewayConfig, base_url: String) -> Result<Self, GatewayError> {
        let mut config = config.clone();
        config.base_url = base_url;
        Self::new(&config)
    }

    /// Issue one provider call. Serializes `body` as JSON when present and
    /// attaches the `apikey` header when configured.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<GatewayResponse, GatewayError> {
        let url = self.url_for(path);

        let mut request = self.client.request(method.clone(), &url);
        if !self.api_key.is_empty() {
            request = request.header("apikey", &self.api_key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(method = %method, path, "gateway request");

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        tracing::debug!(
            method = %method,
            path,
            status,
            body = %truncate_for_log(&body),
            "gateway response"
        );

        Ok(GatewayResponse { status, body })
    }

    // Named wrappers for the provider surface this service consumes.

    pub async fn create_instance(
        &self,
        name: &str,
        number: &str,
        qrcode: bool,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut payload = serde_json::json!({
            "instanceName": name,
            "token": Uuid::new_v4().to_string(),
            "qrcode": qrcode,
            "integration": "WHATSAPP-BAILEYS",
        });
        if !number.is_empty() {
            payload["number"] = Value::String(number.to_string());
        }
        self.call(Method::POST, "/instance/create", Some(&payload))
            .await
    }

    pub async fn fetch_instances(&self, name: &str) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/instance/fetchInstances?instanceName={name}");
        self.call(Method::GET, &path, None).await
    }

    pub async fn connect_instance(
        &self,
        name: &str,
        number: Option<&str>,
    ) -> Result<GatewayResponse, GatewayError> {
        let path = match number {
            Some(number) => format!("/instance/connect/{name}?number={number}"),
            None => format!("/instance/connect/{name}"),
        };
        self.call(Method::GET, &path, None).await
    }

    /// POST variant of the connect call; some provider versions only return
    /// a pairing code when the number travels in the body.
    pub async fn connect_with_number(
        &self,
        name: &str,
        number: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/instance/connect/{name}");
        let payload = serde_json::json!({ "number": number });
        self.call(Method::POST, &path, Some(&payload)).await
    }

    pub async fn logout_instance(&self, name: &str) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/instance/logout/{name}");
        self.call(Method::DELETE, &path, None).await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/instance/delete/{name}");
        self.call(Method::DELETE, &path, None).await
    }

    pub async fn set_settings(
        &self,
        name: &str,
        flags: &SettingsFlags,
    ) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/settings/set/{name}");
        let payload = serde_json::to_value(flags).unwrap_or(Value::Null);
        self.call(Method::POST, &path, Some(&payload)).await
    }

    pub async fn find_settings(&self, name: &str) -> Result<GatewayResponse, GatewayError> {
        let path = format!("/settings/find/{name}");
        self.call(Method::GET, &path, None).await
    }

    fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

fn truncate_for_log(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= LOG_BODY_MAX {
        text.into_owned()
    } else {
        let mut end = LOG_BODY_MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}… ({} bytes)", &text[..end], body.len())
    }
}
