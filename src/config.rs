//! Facilities for reading runtime configuration values
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

#[derive(Serialize, Deserialize)]
/// Driver configuration
pub struct Config {
    /// Output path for extracted part bodies
    pub output_path: String,
    /// Single part output limit (larger bodies are truncated in storage)
    pub max_part_size: u64,
    /// Pretty-print the resulting JSON document
    pub pretty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_path: ".".to_string(),
            max_part_size: 20 * 1024 * 1024,
            pretty: true,
        }
    }
}

impl Config {
    /// Loads the configuration from a `toml` file and environment
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("mimetree.toml"))
            .merge(Env::prefixed("MIMETREE__").split("__"))
            .extract()
            .map_err(|err| {
                error!("Failed to validate configuration: {}", err);
                err
            })?;
        if config.max_part_size > i64::MAX as u64 {
            error!(
                "Value of max_part_size too large (must be strictly < {})",
                i64::MAX
            );
            return Err("Value of max_part_size too large".into());
        }
        Ok(config)
    }
}
