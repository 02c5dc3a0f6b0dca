//! Error types for MargaNav.

use thiserror::Error;

/// MargaNav error type.
#[derive(Error, Debug)]
pub enum MargaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("map error: {0}")]
    Map(String),
}

impl From<toml::de::Error> for MargaError {
    fn from(e: toml::de::Error) -> Self {
        MargaError::Config(e.to_string())
    }
}

impl From<bhumi_map::ConfigError> for MargaError {
    fn from(e: bhumi_map::ConfigError) -> Self {
        MargaError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MargaError>;
