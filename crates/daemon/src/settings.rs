// Daemon settings: defaults, optional taskbed.toml, then TASKBED_* env vars

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use taskbed_core::config::EngineConfig;

pub const DEFAULT_DB_PATH: &str = "~/.taskbed/taskbed.db";
const CONFIG_FILE: &str = "taskbed";
const ENV_PREFIX: &str = "TASKBED";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Tilde-expanded path of the SQLite file
    pub db_path: String,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("reading configuration")?;
        Self::from_config(&raw)
    }

    fn from_config(raw: &Config) -> Result<Self> {
        let engine: EngineConfig = raw
            .clone()
            .try_deserialize()
            .context("parsing engine configuration")?;
        engine.validate()?;

        let db_path = raw
            .get_string("db_path")
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let log_format = match raw.get::<LogFormat>("log_format") {
            Ok(format) => format,
            Err(ConfigError::NotFound(_)) => LogFormat::Pretty,
            Err(e) => return Err(e).context("parsing log_format"),
        };

        Ok(Self {
            db_path: shellexpand::tilde(&db_path).into_owned(),
            log_format,
            engine,
        })
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.db_path)
    }
}
