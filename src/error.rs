//! Error types for the visiontrain engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compute device could not be opened
    #[error("Device error: {0}")]
    Device(String),

    /// A metric pass finished without seeing a single sample
    #[error("Empty data stream: {pass} pass produced no samples")]
    EmptyStream {
        /// Which pass ran dry ("train" or "validation")
        pass: String,
    },

    /// The batch producer did not deliver within the stall timeout
    #[error("Data loader stalled: no batch received within {waited:?}")]
    DataStall {
        /// How long the consumer waited
        waited: Duration,
    },

    /// Dataset or batch assembly error
    #[error("Data error: {0}")]
    Data(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings error
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an empty-stream error for the named pass
    pub fn empty_stream(pass: impl Into<String>) -> Self {
        Self::EmptyStream { pass: pass.into() }
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
