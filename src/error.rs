//! Error types for the script host.

use thiserror::Error;

use crate::script::{CallError, InitError, IntegrityError, RegistryError};

/// Common error type for the script host.
#[derive(Error, Debug)]
pub enum ScriptHostError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration values are inconsistent.
    #[error("validation error: {0}")]
    Validation(String),

    /// A script payload failed the integrity check.
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// A script failed to initialize.
    #[error("init error: {0}")]
    Init(#[from] InitError),

    /// A call into a script failed.
    #[error("script error: {0}")]
    Call(#[from] CallError),

    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type alias for script host operations.
pub type Result<T> = std::result::Result<T, ScriptHostError>;
