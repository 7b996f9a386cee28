use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the isolation pipeline.
///
/// # Why structured errors
///
/// The resilience layer decides whether to retry by looking at the error kind, and the
/// top-level entry points decide whether to surface or degrade the same way. Carrying
/// that information in the variant keeps those decisions out of string matching.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("Image corruption: {path:?} {reason}")]
    ImageCorruption { path: PathBuf, reason: String },

    #[error("Unsupported image format: {extension:?} ({path:?})")]
    UnsupportedImageFormat { path: PathBuf, extension: String },

    #[error("Person detection failed: {message}")]
    PersonDetection { message: String },

    #[error("Background removal failed: {message}")]
    BackgroundRemoval {
        message: String,
        attempts: Vec<(String, String)>,
    },

    #[error("Processing exceeded {budget:?} (elapsed {elapsed:?})")]
    ImageTimeout { elapsed: Duration, budget: Duration },

    #[error("Required prerequisite missing: {message}")]
    RequiredPrerequisite { message: String },

    #[error("Service unavailable: {service}: {message}")]
    ServiceUnavailable { service: String, message: String },

    #[error("Prerequisite check failed: {message}")]
    PrerequisiteCheckFailed { message: String },

    #[error("Service unavailable: circuit '{circuit}' is open (retry in {retry_after:?})")]
    CircuitOpen {
        circuit: String,
        retry_after: Duration,
    },

    #[error("Timed out after {waited:?} waiting for resource '{name}'")]
    ResourceTimeout { name: String, waited: Duration },

    #[error("Resource '{name}' failed to load: {message}")]
    ResourceLoad { name: String, message: String },

    #[error("Unknown resource '{name}'")]
    UnknownResource { name: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, IsolationError>;

/// Coarse classification used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Corruption,
    UnsupportedFormat,
    Detection,
    BackgroundRemoval,
    Timeout,
    Connection,
    Io,
    CircuitOpen,
    Prerequisite,
    Resource,
    Processing,
    Configuration,
}

impl IsolationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImageCorruption { .. } => ErrorKind::Corruption,
            Self::UnsupportedImageFormat { .. } => ErrorKind::UnsupportedFormat,
            Self::PersonDetection { .. } => ErrorKind::Detection,
            Self::BackgroundRemoval { .. } => ErrorKind::BackgroundRemoval,
            // the processing budget is terminal; only resource waits count as transient timeouts
            Self::ImageTimeout { .. } => ErrorKind::Processing,
            Self::ResourceTimeout { .. } => ErrorKind::Timeout,
            Self::ServiceUnavailable { .. } => ErrorKind::Connection,
            Self::FileSystem { .. } => ErrorKind::Io,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RequiredPrerequisite { .. } | Self::PrerequisiteCheckFailed { .. } => {
                ErrorKind::Prerequisite
            }
            Self::ResourceLoad { .. } | Self::UnknownResource { .. } => ErrorKind::Resource,
            Self::ImageProcessing { .. } | Self::Model { .. } => ErrorKind::Processing,
            Self::Configuration { .. } | Self::Validation { .. } => ErrorKind::Configuration,
        }
    }

    /// Input validation failures are surfaced to the caller as-is and never retried.
    pub fn is_input_validation(&self) -> bool {
        matches!(
            self,
            Self::ImageCorruption { .. } | Self::UnsupportedImageFormat { .. }
        )
    }

    pub fn detection(message: impl Into<String>) -> Self {
        Self::PersonDetection {
            message: message.into(),
        }
    }

    pub fn model(operation: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn processing(
        path: impl Into<String>,
        operation: impl Into<String>,
        source: impl Into<BoxedSource>,
    ) -> Self {
        Self::ImageProcessing {
            path: path.into(),
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Used at the binary boundary where `anyhow` contexts meet library calls.
impl From<anyhow::Error> for IsolationError {
    fn from(err: anyhow::Error) -> Self {
        IsolationError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct `IsolationError::FileSystem` directly with the
/// specific path and operation.
impl From<std::io::Error> for IsolationError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for IsolationError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for IsolationError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor handling around inference, so they are model errors.
impl From<ndarray::ShapeError> for IsolationError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

/// Transport failures of the remote isolation backend.
impl From<reqwest::Error> for IsolationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::PrerequisiteCheckFailed {
                message: format!("malformed response: {err}"),
            };
        }
        Self::ServiceUnavailable {
            service: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "remote isolation".to_string()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_transient() {
        let err = IsolationError::ImageCorruption {
            path: "a.png".into(),
            reason: "zero-byte file".to_string(),
        };
        assert!(err.is_input_validation());
        assert_eq!(err.kind(), ErrorKind::Corruption);

        let err = IsolationError::ImageTimeout {
            elapsed: Duration::from_secs(3),
            budget: Duration::from_secs(2),
        };
        assert!(!err.is_input_validation());
        assert_ne!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_circuit_open_reads_as_service_unavailable() {
        let err = IsolationError::CircuitOpen {
            circuit: "isolate_person".to_string(),
            retry_after: Duration::from_secs(10),
        };
        assert!(err.to_string().starts_with("Service unavailable"));
    }
}
