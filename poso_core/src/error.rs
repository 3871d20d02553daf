//! Error types for the poso_core library.
//!
//! Only loading and persistence can fail. Dose computation, conversion and
//! lookup report missing or unusable data as values instead.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for poso_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Drug catalog validation error
    #[error("Catalog validation error: {0}")]
    CatalogValidation(String),

    /// Posology table could not be used
    #[error("Posology error: {0}")]
    Posology(String),

    /// Invalid patient input
    #[error("Patient error: {0}")]
    Patient(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
