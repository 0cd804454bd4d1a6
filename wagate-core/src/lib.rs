pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod store;

pub use config::WagateConfig;
pub use error::WagateError;
pub use gateway::{GatewayClient, GatewayError, GatewayResponse};
pub use models::session::{ConnectionStatus, Session, SettingsFlags};
pub use store::{MemorySessionStore, PgSessionStore, SessionStore};
