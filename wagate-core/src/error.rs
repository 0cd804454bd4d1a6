use thiserror::Error;

use crate::gateway::GatewayError;

/// Service error taxonomy.
///
/// `Validation` and `NotProvisioned` are caller mistakes and are never
/// retried. `ProviderUnavailable` means the gateway could not be reached at
/// the transport level; `ProviderRejected` means it was reached and refused.
/// The two must never be conflated.
#[derive(Error, Debug)]
pub enum WagateError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no instance provisioned for this tenant")]
    NotProvisioned,

    #[error("gateway unreachable: {0}")]
    ProviderUnavailable(#[from] GatewayError),

    #[error("gateway rejected the request ({status}): {detail}")]
    ProviderRejected { status: u16, detail: String },

    #[error("gateway returned no {0} after all fallbacks")]
    NoCode(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
