//! RHI error types.

use std::path::PathBuf;

use thiserror::Error;

use super::resource::ResourceKind;
use super::types::BufferUsage;

/// Errors surfaced by device, swap chain and context operations.
///
/// Backend API failures arrive as `anyhow::Error` with the context the
/// backend attached; everything else is a condition the core detects itself.
#[derive(Debug, Error)]
pub enum RhiError {
    #[error("buffer with {0:?} usage cannot be mapped for CPU writes")]
    NotMappable(BufferUsage),

    #[error("{0:?} handle is stale or belongs to another device")]
    InvalidHandle(ResourceKind),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("failed to compile shader '{name}': {details}")]
    ShaderCompilation { name: String, details: String },

    #[error("failed to read shader source {path:?}")]
    ShaderSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("swap chain back buffer is not available")]
    BackBufferUnavailable,

    #[error("render device has been shut down")]
    DeviceShutDown,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type RhiResult<T> = Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RhiError::NotMappable(BufferUsage::Immutable);
        assert_eq!(
            err.to_string(),
            "buffer with Immutable usage cannot be mapped for CPU writes"
        );

        let err = RhiError::ShaderCompilation {
            name: "triangle.wgsl".into(),
            details: "no vertex entry point".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to compile shader 'triangle.wgsl': no vertex entry point"
        );
    }

    #[test]
    fn backend_errors_keep_their_message() {
        let err: RhiError = anyhow::anyhow!("Failed to create swapchain").into();
        assert_eq!(err.to_string(), "Failed to create swapchain");
    }
}
