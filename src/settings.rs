use std::path::Path;

use config::{Config, Environment as EnvironmentSource, File};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::environment::Invalidation;
use crate::error::Result;

pub const ENV_PREFIX: &str = "OPENFLOW_ORM";

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file, in-memory when absent
    pub path: Option<String>,
    /// log every statement at info level
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub log_filter: String,
    pub invalidation: Invalidation,
    pub search_limit: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            log_filter: "info".into(),
            invalidation: Invalidation::Full,
            search_limit: None,
        }
    }
}

impl Settings {
    /// Defaults, overridden by an optional file, overridden by environment
    /// variables such as `OPENFLOW_ORM_DATABASE__PATH`.
    pub fn load(file: Option<&Path>) -> Result<Settings> {
        let mut builder = Config::builder()
            .set_default("database.echo", false)?
            .set_default("log_filter", "info")?
            .set_default("invalidation", "full")?;
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }
        let settings = builder
            .add_source(
                EnvironmentSource::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `filter`; calling
/// this more than once is harmless.
pub fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
