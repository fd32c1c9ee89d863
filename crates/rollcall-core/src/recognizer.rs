//! ArcFace recognizer via ONNX Runtime.
//!
//! Training extracts a 512-dimensional embedding per sample and reduces each
//! label to the normalized mean of its embeddings. Prediction returns the
//! nearest centroid by cosine distance.

use crate::alignment::SAMPLE_SIZE;
use crate::capability::FaceRecognizer;
use crate::error::VisionError;
use crate::pool::SessionPool;
use crate::types::{Embedding, Label, LabeledFace, Prediction};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalization is symmetric
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// One label's reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Centroid {
    pub label: Label,
    pub embedding: Embedding,
    /// Number of samples averaged into this centroid.
    pub samples: usize,
}

/// Trained artifact: one centroid per label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidModel {
    pub embedder: String,
    pub centroids: Vec<Centroid>,
}

impl CentroidModel {
    /// Average the (unit-length) embeddings of each label.
    pub fn fit(
        embedder: &str,
        embeddings: impl IntoIterator<Item = (Label, Embedding)>,
    ) -> Result<Self, VisionError> {
        let mut sums: BTreeMap<Label, (Vec<f32>, usize)> = BTreeMap::new();
        for (label, embedding) in embeddings {
            let embedding = embedding.normalized();
            let (sum, count) = sums
                .entry(label)
                .or_insert_with(|| (vec![0.0; embedding.values.len()], 0));
            if sum.len() != embedding.values.len() {
                return Err(VisionError::InferenceFailed(format!(
                    "embedding dimension mismatch for label {label}: {} vs {}",
                    sum.len(),
                    embedding.values.len()
                )));
            }
            for (s, v) in sum.iter_mut().zip(&embedding.values) {
                *s += v;
            }
            *count += 1;
        }

        if sums.is_empty() {
            return Err(VisionError::EmptyTrainingSet);
        }

        let centroids = sums
            .into_iter()
            .map(|(label, (values, samples))| Centroid {
                label,
                embedding: Embedding { values }.normalized(),
                samples,
            })
            .collect();

        Ok(Self {
            embedder: embedder.to_string(),
            centroids,
        })
    }

    /// Nearest centroid to `probe`. Every centroid is compared.
    pub fn nearest(&self, probe: &Embedding) -> Option<Prediction> {
        self.centroids
            .iter()
            .map(|c| Prediction {
                label: c.label,
                distance: probe.distance(&c.embedding).max(0.0),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }
}

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    pool: SessionPool,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model with `sessions` parallel inference sessions.
    pub fn load(model_path: &str, sessions: usize) -> Result<Self, VisionError> {
        Ok(Self {
            pool: SessionPool::load(model_path, sessions)?,
        })
    }

    /// Extract an L2-normalized embedding from a normalized face crop.
    pub fn embed(&self, face: &GrayImage) -> Result<Embedding, VisionError> {
        let input = Self::preprocess(face);

        let raw = self.pool.with_session(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| VisionError::InferenceFailed(format!("embedding extraction: {e}")))?;
            Ok(data.to_vec())
        })?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(VisionError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding { values: raw }.normalized())
    }

    /// Convert a grayscale crop into a 1×3×112×112 float tensor.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized;
        let face = if face.dimensions() == (size as u32, size as u32) {
            face
        } else {
            resized = imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in face.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = normalized;
            }
        }
        tensor
    }
}

impl FaceRecognizer for ArcFaceRecognizer {
    type Model = CentroidModel;

    fn train(&self, samples: &[LabeledFace]) -> Result<CentroidModel, VisionError> {
        let mut embeddings = Vec::with_capacity(samples.len());
        for sample in samples {
            embeddings.push((sample.label, self.embed(&sample.face)?));
        }
        let model = CentroidModel::fit(ARCFACE_MODEL_VERSION, embeddings)?;
        tracing::info!(
            samples = samples.len(),
            labels = model.centroids.len(),
            "ArcFace centroid model trained"
        );
        Ok(model)
    }

    fn predict(&self, model: &CentroidModel, face: &GrayImage) -> Result<Prediction, VisionError> {
        let probe = self.embed(face)?;
        model
            .nearest(&probe)
            .ok_or_else(|| VisionError::InferenceFailed("model has no centroids".into()))
    }
}

// Samples are stored at the ArcFace input size; a mismatch would force a
// resize on every embedding.
const _: () = assert!(SAMPLE_SIZE as usize == ARCFACE_INPUT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec() }
    }

    #[test]
    fn test_preprocess_output_shape() {
        let face = GrayImage::from_pixel(112, 112, Luma([128]));
        let tensor = ArcFaceRecognizer::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = GrayImage::from_pixel(112, 112, Luma([128]));
        let tensor = ArcFaceRecognizer::preprocess(&face);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 1, 5, 7]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_resizes_foreign_size() {
        let face = GrayImage::from_pixel(150, 150, Luma([0]));
        let tensor = ArcFaceRecognizer::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 111, 111]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_averages_per_label() {
        let model = CentroidModel::fit(
            "test",
            vec![
                (0, emb(&[1.0, 0.0])),
                (0, emb(&[0.0, 1.0])),
                (1, emb(&[-1.0, 0.0])),
            ],
        )
        .unwrap();

        assert_eq!(model.centroids.len(), 2);
        let c0 = &model.centroids[0];
        assert_eq!((c0.label, c0.samples), (0, 2));
        let h = std::f32::consts::FRAC_1_SQRT_2;
        assert!((c0.embedding.values[0] - h).abs() < 1e-6);
        assert!((c0.embedding.values[1] - h).abs() < 1e-6);
    }

    #[test]
    fn test_fit_empty_rejected() {
        let err = CentroidModel::fit("test", Vec::new()).unwrap_err();
        assert!(matches!(err, VisionError::EmptyTrainingSet));
    }

    #[test]
    fn test_fit_dimension_mismatch_rejected() {
        let err = CentroidModel::fit("test", vec![(0, emb(&[1.0, 0.0])), (0, emb(&[1.0]))]);
        assert!(err.is_err());
    }

    #[test]
    fn test_nearest_picks_lowest_distance() {
        let model = CentroidModel::fit(
            "test",
            vec![
                (0, emb(&[0.0, 1.0, 0.0])),
                (1, emb(&[0.0, 0.0, 1.0])),
                (2, emb(&[1.0, 0.0, 0.0])),
            ],
        )
        .unwrap();

        let p = model.nearest(&emb(&[0.9, 0.1, 0.0])).unwrap();
        assert_eq!(p.label, 2);
        assert!(p.distance < 0.01);
    }

    #[test]
    fn test_model_serializes() {
        let model = CentroidModel::fit("test", vec![(3, emb(&[1.0, 0.0]))]).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: CentroidModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.centroids[0].label, 3);
        assert_eq!(back.embedder, "test");
    }
}
