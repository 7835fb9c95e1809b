use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use cs_bridge::BridgeConfig;
use cs_offboard::OffboardConfig;
use cs_server::ServerConfig;
use cs_telemetry::TelemetryConfig;

#[derive(Debug, Deserialize)]
pub struct CopterSystemConfig {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub offboard: OffboardConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl CopterSystemConfig {
    pub fn read() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("copter-system"))
            .add_source(Environment::with_prefix("COPTER_SYSTEM").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn read_from_path(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("COPTER_SYSTEM").separator("__"))
            .build()?
            .try_deserialize()
    }
}
