pub mod http;
pub mod locks;
pub mod subsystems;
