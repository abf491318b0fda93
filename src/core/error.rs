//! Error types for the landscape engine

use thiserror::Error;

/// Main error type for the landscape engine
#[derive(Debug, Error)]
pub enum Error {
    /// A buffer, texture or state object could not be created.
    #[error("Resource error: {0}")]
    Resource(String),

    /// A world database query, bind or transaction step failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Landscape-wide geometric precondition violated.
    #[error("Geometry error: {0}")]
    Geometry(String),

    /// Zero-sized bounds, empty height field and similar inputs.
    #[error("Degenerate input: {0}")]
    Degenerate(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}
