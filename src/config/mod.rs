pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod gateway;
pub mod types;

pub use cli::CliConfig;
pub use config::Config;
pub use gateway::{BackendSettings, GatewayConfig, GatewayConfigError, SlotSettings, TlsSettings};
pub use types::LogLevel;
