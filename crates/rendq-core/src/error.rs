//! Error types for the rendq core library.

use thiserror::Error;

/// Result type alias using the rendq core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for rendq operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Render command could not be split into program and arguments
    #[error("Invalid command: {0}")]
    Command(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}
