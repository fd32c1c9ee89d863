use rollcall_core::VisionError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no samples to train on")]
    NoSamples,
    #[error("training backend error: {0}")]
    TrainingBackend(String),
    #[error("vision backend error: {0}")]
    Vision(VisionError),
    #[error("{what} timed out after {limit:?}")]
    Timeout { what: &'static str, limit: Duration },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("model artifact corrupt: {0}")]
    CorruptModel(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image codec: {0}")]
    Image(#[from] image::ImageError),
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

impl From<VisionError> for EngineError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::UnreadableImage(msg) => EngineError::UnreadableImage(msg),
            other => EngineError::Vision(other),
        }
    }
}

impl EngineError {
    /// Errors caused by the request itself rather than the service.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidIdentity(_)
                | EngineError::InvalidRequest(_)
                | EngineError::UnreadableImage(_)
                | EngineError::NoFaceDetected
        )
    }
}
