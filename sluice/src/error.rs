//! Error types for sluice.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SluiceError>;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("unable to encode message: {0}")]
    Encode(String),

    #[error("unable to decode message: {0}")]
    Decode(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("pipeline is shut down")]
    Shutdown,
}

impl SluiceError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }
}
