use std::path::PathBuf;

/// Failures raised inside a capture invocation.
///
/// None of these escape the capture routine: they are folded into a
/// [`RunSummary`](crate::routine::RunSummary) terminal reason.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Output directory could not be created or written
    #[error("output directory {path} is not writable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Camera could not be opened or is not live after opening
    #[error("camera {address} unavailable: {reason}")]
    CameraUnavailable { address: String, reason: String },

    /// A single frame pull failed
    #[error("frame read failed: {0}")]
    Read(String),

    /// Video artifact could not be created or appended to
    #[error("video writer error: {0}")]
    Video(String),

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),
}

impl CaptureError {
    pub fn unavailable(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::CameraUnavailable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
