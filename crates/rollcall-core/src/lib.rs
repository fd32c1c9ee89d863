//! rollcall-core: vision capabilities for the rollcall pipeline.
//!
//! Defines the detector/recognizer seams consumed by the orchestration
//! engine, plus the ONNX-backed implementations: SCRFD for detection and
//! ArcFace embeddings reduced to per-label centroids for recognition.

pub mod alignment;
pub mod capability;
pub mod detector;
pub mod error;
pub mod frame;
mod pool;
pub mod recognizer;
pub mod types;

pub use alignment::{normalize_face, SAMPLE_SIZE};
pub use capability::{FaceDetector, FaceRecognizer};
pub use detector::ScrfdDetector;
pub use error::VisionError;
pub use frame::decode_image;
pub use recognizer::{ArcFaceRecognizer, CentroidModel};
pub use types::{BoundingBox, Embedding, Label, LabeledFace, Prediction};

pub use image::GrayImage;

/// Default directory searched for `det_10g.onnx` and `w600k_r50.onnx`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
