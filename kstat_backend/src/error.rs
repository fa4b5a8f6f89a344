/*!
Error types for the orchestration backend.
*/

use shared::units::UnknownSetting;
use shared::ProtocolError;
use thiserror::Error;

use crate::hardware::HardwareError;

/// Failures talking to the shared state store
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("State store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State document could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("State document corrupt: {0}")]
    Corrupt(String),
}

/// A document attribute a measurement needs is missing or unusable
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing {component}.{attribute}")]
    Missing { component: String, attribute: String },

    #[error("Invalid {component}.{attribute}: expected {expected}")]
    Invalid {
        component: String,
        attribute: String,
        expected: &'static str,
    },

    #[error("Unknown program {0:?}")]
    UnknownProgram(String),

    #[error(transparent)]
    Setting(#[from] UnknownSetting),
}

impl ConfigError {
    pub fn missing(component: &str, attribute: &str) -> Self {
        Self::Missing {
            component: component.to_string(),
            attribute: attribute.to_string(),
        }
    }

    pub fn invalid(component: &str, attribute: &str, expected: &'static str) -> Self {
        Self::Invalid {
            component: component.to_string(),
            attribute: attribute.to_string(),
            expected,
        }
    }
}

/// Why a measurement job did not produce results
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Instrument error: {0}")]
    Protocol(ProtocolError),

    #[error("A measurement is already running")]
    Busy,

    #[error("Measurement cancelled")]
    Cancelled,

    #[error("Failed to write results: {0}")]
    Persist(#[from] csv::Error),

    #[error("Positioner error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Measurement thread panicked: {0}")]
    Panicked(String),
}

/// A cancelled codec exchange becomes [`JobError::Cancelled`]
impl From<ProtocolError> for JobError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Cancelled => Self::Cancelled,
            other => Self::Protocol(other),
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::Persist(csv::Error::from(e))
    }
}
