use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
