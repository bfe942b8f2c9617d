use crate::metrics_defs::{MetricDef, describe_all};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use serde::Deserialize;

fn default_prefix() -> String {
    "keysync".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a global metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Install a StatsD recorder as the global metrics recorder and describe
/// every metric that will be emitted through it.
pub fn init(config: &MetricsConfig, defs: &[MetricDef]) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;

    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    describe_all(defs);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Metrics exporter installed"
    );

    Ok(())
}
