use federation::config::{ConfigError as FederationConfigError, FederationConfig, ValidationError};
use federation::events::Direction;
use serde::Deserialize;
use shared::metrics::MetricsConfig;
use shared::telemetry::LoggingConfig;
use std::fs::File;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    pub federation: FederationConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.federation.validate()?;

        Ok(config)
    }

    /// Environment based configuration, used when no config file is given.
    /// `SENTRY_DSN`, `LOG_LEVEL` and the `STATSD_*` variables are optional.
    pub fn from_env(direction: Direction) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), direction)
    }

    fn from_lookup<F>(lookup: F, direction: Direction) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let logging = LoggingConfig {
            sentry_dsn: lookup("SENTRY_DSN"),
            level: lookup("LOG_LEVEL").unwrap_or(LoggingConfig::default().level),
        };

        let metrics = match (lookup("STATSD_HOST"), lookup("STATSD_PORT")) {
            (Some(statsd_host), Some(port)) => Some(MetricsConfig {
                statsd_host,
                statsd_port: port
                    .parse()
                    .map_err(|_| ConfigError::InvalidStatsdPort(port))?,
                prefix: lookup("STATSD_PREFIX").unwrap_or_else(|| "keysync".into()),
            }),
            _ => None,
        };

        Ok(Config {
            logging,
            metrics,
            federation: FederationConfig::from_lookup(lookup, direction)?,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Environment(#[from] FederationConfigError),
    #[error("invalid STATSD_PORT {0:?}")]
    InvalidStatsdPort(String),
}
