//! Error types for the Waterline service.

use thiserror::Error;

/// Main error type for Waterline operations.
#[derive(Error, Debug)]
pub enum WaterlineError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mesh transport errors
    #[error("Mesh error: {0}")]
    Mesh(#[from] crate::mesh::MeshError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Waterline operations.
pub type Result<T> = std::result::Result<T, WaterlineError>;
