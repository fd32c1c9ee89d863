//! rollcall-engine: enrollment, training and recognition orchestration.
//!
//! Turns uploaded images into per-identity samples, retrains the recognizer
//! in the background when sample counts cross a trigger, serves recognition
//! against the active model and its frozen label mapping, and records
//! deduplicated attendance.

pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod jobs;
pub mod label_registry;
pub mod ledger;
pub mod model_store;
pub mod orchestrator;
pub mod sample_store;
mod task;

pub use engine::{EnrollReport, EnrollStatus, Engine, EngineStatus, IdentityCount, ModelInfo, Recognition};
pub use error::EngineError;
pub use gateway::{FaceMatch, RecognitionOutcome};
pub use identity::Identity;
pub use jobs::{JobStatus, TrainingJob, TriggerReason};
pub use label_registry::{LabelEntry, LabelMapping};
pub use ledger::{AttendanceSummary, DailySummary, MonthlyReport, MonthlyRow, PresentEntry};
pub use model_store::{ModelHandle, ModelSlot, ModelStore};
pub use orchestrator::{TriggerDecision, TriggerPolicy};

use std::path::PathBuf;
use std::time::Duration;

/// Engine settings. The daemon fills this from its own config layers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for the database, sample buckets and model versions.
    pub data_dir: PathBuf,
    pub training_step: u64,
    pub training_cap: u64,
    /// Faces are accepted only below this distance.
    pub distance_threshold: f32,
    pub dedup_window: Duration,
    /// Bound on one detection or recognition call.
    pub vision_timeout: Duration,
    /// Bound on one training run.
    pub training_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            training_step: 200,
            training_cap: 1000,
            distance_threshold: 0.60,
            dedup_window: Duration::from_secs(60),
            vision_timeout: Duration::from_secs(10),
            training_timeout: Duration::from_secs(600),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("rollcall.db")
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.data_dir.join("samples")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }
}
