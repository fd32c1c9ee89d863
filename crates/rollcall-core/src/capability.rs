//! Capability seams between the orchestration engine and the vision backend.
//!
//! Both traits are synchronous and may be CPU-bound; callers are expected to
//! run them on a blocking pool. Implementations must be shareable across
//! threads so concurrent requests do not serialize on one instance.

use crate::error::VisionError;
use crate::types::{BoundingBox, LabeledFace, Prediction};
use image::GrayImage;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Locates faces in a grayscale image.
pub trait FaceDetector: Send + Sync + 'static {
    /// Zero or more boxes. Order is stable within one call.
    fn detect(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, VisionError>;
}

/// Trains a recognition model from labeled samples and scores faces against it.
pub trait FaceRecognizer: Send + Sync + 'static {
    /// Trained artifact. Persisted as JSON next to its label mapping.
    type Model: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Train on the full sample set. Succeeds or fails as a whole.
    fn train(&self, samples: &[LabeledFace]) -> Result<Self::Model, VisionError>;

    /// Nearest label for one normalized face crop.
    fn predict(&self, model: &Self::Model, face: &GrayImage) -> Result<Prediction, VisionError>;
}
