//! Recognition gateway: detect, normalize, score and gate faces against the
//! active model.

use crate::error::EngineError;
use crate::identity::Identity;
use crate::label_registry::LabelMapping;
use crate::model_store::{ModelHandle, ModelSlot};
use crate::task::run_blocking;
use rollcall_core::{decode_image, normalize_face, FaceDetector, FaceRecognizer, Label, Prediction};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Score of one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    /// Resolved identity, `None` when the label is outside the bound mapping.
    pub identity: Option<Identity>,
    pub label: Label,
    pub distance: f32,
    /// True when the identity resolved and the distance passed the gate.
    pub accepted: bool,
}

/// Caller-visible result of a recognition request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Identified {
        identity: Identity,
        distance: f32,
        model_version: u64,
    },
    /// Faces were found but none passed the gate. `distance` is the closest one.
    Unknown {
        distance: Option<f32>,
        model_version: u64,
    },
    NoFace,
    NoModel,
}

impl RecognitionOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            RecognitionOutcome::Identified { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

pub struct RecognitionGateway<D, R: FaceRecognizer> {
    detector: Arc<D>,
    recognizer: Arc<R>,
    slot: Arc<ModelSlot<R::Model>>,
    threshold: f32,
    timeout: Duration,
}

impl<D: FaceDetector, R: FaceRecognizer> RecognitionGateway<D, R> {
    pub fn new(
        detector: Arc<D>,
        recognizer: Arc<R>,
        slot: Arc<ModelSlot<R::Model>>,
        threshold: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            detector,
            recognizer,
            slot,
            threshold,
            timeout,
        }
    }

    /// Recognize every face in `image` and pick the caller-visible outcome.
    ///
    /// The model handle is captured once up front; a model published while
    /// this request runs does not affect it.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
    ) -> Result<(RecognitionOutcome, Vec<FaceMatch>), EngineError> {
        let Some(handle) = self.slot.current() else {
            return Ok((RecognitionOutcome::NoModel, Vec::new()));
        };

        let detector = Arc::clone(&self.detector);
        let recognizer = Arc::clone(&self.recognizer);
        let scoring = Arc::clone(&handle);
        let threshold = self.threshold;

        let faces = run_blocking("recognition", self.timeout, move || {
            let frame = decode_image(&image)?;
            let boxes = detector.detect(&frame)?;
            let mut faces = Vec::with_capacity(boxes.len());
            for face in boxes.iter().filter_map(|b| normalize_face(&frame, b)) {
                let prediction = recognizer.predict(&scoring.model, &face)?;
                faces.push(score_face(&scoring.mapping, prediction, threshold));
            }
            Ok(faces)
        })
        .await?;

        let outcome = best_outcome(&faces, handle.version);
        tracing::debug!(faces = faces.len(), version = handle.version, ?outcome, "recognition scored");
        Ok((outcome, faces))
    }

    pub fn active_model(&self) -> Option<Arc<ModelHandle<R::Model>>> {
        self.slot.current()
    }
}

/// Resolve one prediction through the mapping bound to its model and gate it.
pub fn score_face(mapping: &LabelMapping, prediction: Prediction, threshold: f32) -> FaceMatch {
    let identity = mapping.resolve(prediction.label).cloned();
    if identity.is_none() {
        tracing::debug!(label = prediction.label, labels = mapping.len(), "label outside bound mapping");
    }
    let accepted = identity.is_some() && prediction.distance < threshold;
    FaceMatch {
        identity,
        label: prediction.label,
        distance: prediction.distance,
        accepted,
    }
}

/// The accepted face with the lowest distance, otherwise `Unknown` carrying
/// the lowest distance seen.
pub fn best_outcome(faces: &[FaceMatch], model_version: u64) -> RecognitionOutcome {
    if faces.is_empty() {
        return RecognitionOutcome::NoFace;
    }

    let best_accepted = faces
        .iter()
        .filter(|f| f.accepted)
        .min_by(|a, b| a.distance.total_cmp(&b.distance));

    match best_accepted.and_then(|f| f.identity.clone().map(|id| (id, f.distance))) {
        Some((identity, distance)) => RecognitionOutcome::Identified {
            identity,
            distance,
            model_version,
        },
        None => RecognitionOutcome::Unknown {
            distance: faces.iter().map(|f| f.distance).min_by(f32::total_cmp),
            model_version,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(names: &[&str]) -> LabelMapping {
        let ids: Vec<Identity> = names.iter().map(|n| Identity::parse(n).unwrap()).collect();
        LabelMapping::snapshot(&ids)
    }

    fn prediction(label: Label, distance: f32) -> Prediction {
        Prediction { label, distance }
    }

    #[test]
    fn test_score_accepts_below_threshold() {
        let m = mapping(&["ana", "bob"]);
        let face = score_face(&m, prediction(1, 0.2), 0.6);
        assert!(face.accepted);
        assert_eq!(face.identity.unwrap().as_str(), "bob");
    }

    #[test]
    fn test_score_gate_is_strict() {
        let m = mapping(&["ana"]);
        assert!(!score_face(&m, prediction(0, 0.6), 0.6).accepted);
        assert!(!score_face(&m, prediction(0, 0.9), 0.6).accepted);
    }

    #[test]
    fn test_score_out_of_range_label_is_unknown() {
        let m = mapping(&["ana"]);
        let face = score_face(&m, prediction(5, 0.01), 0.6);
        assert!(face.identity.is_none());
        assert!(!face.accepted);
    }

    #[test]
    fn test_best_outcome_no_faces() {
        assert_eq!(best_outcome(&[], 1), RecognitionOutcome::NoFace);
    }

    #[test]
    fn test_best_outcome_picks_lowest_accepted() {
        let m = mapping(&["ana", "bob"]);
        let faces = vec![
            score_face(&m, prediction(0, 0.5), 0.6),
            score_face(&m, prediction(1, 0.1), 0.6),
            score_face(&m, prediction(9, 0.01), 0.6),
        ];
        match best_outcome(&faces, 3) {
            RecognitionOutcome::Identified {
                identity,
                distance,
                model_version,
            } => {
                assert_eq!(identity.as_str(), "bob");
                assert_eq!(distance, 0.1);
                assert_eq!(model_version, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_best_outcome_unknown_reports_closest() {
        let m = mapping(&["ana"]);
        let faces = vec![
            score_face(&m, prediction(0, 0.9), 0.6),
            score_face(&m, prediction(0, 0.7), 0.6),
        ];
        assert_eq!(
            best_outcome(&faces, 2),
            RecognitionOutcome::Unknown {
                distance: Some(0.7),
                model_version: 2
            }
        );
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(RecognitionOutcome::NoModel).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "no_model"}));
    }
}
