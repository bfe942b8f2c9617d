pub mod metrics;
pub mod metrics_defs;
pub mod telemetry;
