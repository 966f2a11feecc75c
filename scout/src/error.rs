//! Crate-level error types

use thiserror::Error;

use crate::fault::Fault;
use crate::orchestration::PlanError;
use crate::router::RouterError;

/// Configuration loading and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ScoutError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("metrics setup failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}

pub type Result<T> = std::result::Result<T, ScoutError>;
