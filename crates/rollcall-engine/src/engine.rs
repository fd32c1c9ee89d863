//! Engine facade: wires the stores, the training worker, the gateway and the
//! ledger together behind the operations exposed to transports.

use crate::db::Database;
use crate::error::EngineError;
use crate::gateway::{FaceMatch, RecognitionGateway, RecognitionOutcome};
use crate::identity::Identity;
use crate::jobs::{JobLog, TrainingJob, TriggerReason};
use crate::ledger::{AttendanceLedger, AttendanceSummary, DailySummary, MonthlyReport};
use crate::model_store::{ModelSlot, ModelStore};
use crate::orchestrator::{TrainingOrchestrator, TriggerDecision, TriggerPolicy};
use crate::sample_store::{crop_faces, SampleStore};
use crate::task::{run_blocking, run_storage};
use crate::EngineConfig;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{decode_image, FaceDetector, FaceRecognizer};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollStatus {
    /// Samples stored; no training was triggered by this call.
    Waiting,
    /// This call crossed a trigger; a training job is scheduled.
    Training,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollReport {
    pub samples_written: usize,
    pub total_samples: u64,
    pub status: EnrollStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Result of a recognition request, including the attendance side effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    #[serde(flatten)]
    pub outcome: RecognitionOutcome,
    pub faces: Vec<FaceMatch>,
    pub attendance_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityCount {
    pub identity: Identity,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub identities: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub active_model: Option<ModelInfo>,
    pub identities: usize,
    pub samples: usize,
    pub last_job: Option<TrainingJob>,
}

pub struct Engine<D: FaceDetector, R: FaceRecognizer> {
    config: EngineConfig,
    detector: Arc<D>,
    samples: Arc<SampleStore>,
    ledger: Arc<AttendanceLedger>,
    jobs: JobLog,
    orchestrator: Arc<TrainingOrchestrator<R>>,
    gateway: RecognitionGateway<D, R>,
    worker: JoinHandle<()>,
}

impl<D: FaceDetector, R: FaceRecognizer> Engine<D, R> {
    /// Open storage under `config.data_dir`, restore the last published
    /// model and start the training worker. Must run inside a Tokio runtime.
    pub async fn start(config: EngineConfig, detector: D, recognizer: R) -> Result<Self, EngineError> {
        let dedup_window = chrono::Duration::from_std(config.dedup_window)
            .map_err(|e| EngineError::InvalidRequest(format!("dedup window: {e}")))?;

        let paths = config.clone();
        let (db, samples, models, restored) = run_storage("engine startup", move || {
            let db = Database::open(&paths.db_path())?;
            JobLog::new(db.clone()).fail_interrupted()?;
            let samples = SampleStore::open(paths.samples_dir())?;
            let models = ModelStore::open(paths.models_dir())?;
            let restored = models.load_latest::<R::Model>()?;
            Ok((db, samples, models, restored))
        })
        .await?;

        match &restored {
            Some(handle) => tracing::info!(
                version = handle.version,
                labels = handle.mapping.len(),
                "restored active model"
            ),
            None => tracing::info!("no trained model yet"),
        }

        let detector = Arc::new(detector);
        let recognizer = Arc::new(recognizer);
        let samples = Arc::new(samples);
        let slot = Arc::new(ModelSlot::new(restored));

        let orchestrator = Arc::new(TrainingOrchestrator::new(
            TriggerPolicy {
                step: config.training_step,
                cap: config.training_cap,
            },
            db.clone(),
            Arc::clone(&samples),
            Arc::new(models),
            Arc::clone(&slot),
            Arc::clone(&recognizer),
            config.training_timeout,
        ));
        let worker = orchestrator.spawn_worker();

        let gateway = RecognitionGateway::new(
            Arc::clone(&detector),
            recognizer,
            slot,
            config.distance_threshold,
            config.vision_timeout,
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            step = config.training_step,
            cap = config.training_cap,
            threshold = config.distance_threshold,
            "engine started"
        );

        Ok(Self {
            ledger: Arc::new(AttendanceLedger::new(db.clone(), dedup_window)),
            jobs: JobLog::new(db),
            config,
            detector,
            samples,
            orchestrator,
            gateway,
            worker,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store every face found in `image` as a sample of `identity` and
    /// schedule training when the identity's count crosses a trigger.
    pub async fn enroll(&self, identity: &str, image: Vec<u8>) -> Result<EnrollReport, EngineError> {
        let identity = Identity::parse(identity)?;

        let detector = Arc::clone(&self.detector);
        let crops = run_blocking("face detection", self.config.vision_timeout, move || {
            let frame = decode_image(&image)?;
            crop_faces(detector.as_ref(), &frame)
        })
        .await?;
        if crops.is_empty() {
            tracing::debug!(identity = %identity, "enrollment image has no usable face");
            return Err(EngineError::NoFaceDetected);
        }

        let samples = Arc::clone(&self.samples);
        let orchestrator = Arc::clone(&self.orchestrator);
        let who = identity.clone();
        let (written, total, decision) = run_storage("enrollment", move || {
            let region = orchestrator.counters().region(&who);
            let _exclusive = region.lock().unwrap_or_else(|p| p.into_inner());

            let written = samples.write_samples(&who, &crops)?;
            match orchestrator.on_samples_added(&who, written.len() as u64) {
                Ok((total, decision)) => Ok((written.len(), total, decision)),
                Err(e) => {
                    samples.discard(&written);
                    Err(e)
                }
            }
        })
        .await?;

        let (status, job_id) = match decision {
            TriggerDecision::Scheduled { job_id, .. } => (EnrollStatus::Training, Some(job_id)),
            TriggerDecision::None => (EnrollStatus::Waiting, None),
        };
        tracing::info!(identity = %identity, written, total, ?status, "samples enrolled");

        Ok(EnrollReport {
            samples_written: written,
            total_samples: total,
            status,
            job_id,
        })
    }

    pub async fn recognize(&self, image: Vec<u8>) -> Result<Recognition, EngineError> {
        self.recognize_at(image, Utc::now()).await
    }

    /// Recognize and, when a face is identified, record attendance at `observed_at`.
    pub async fn recognize_at(
        &self,
        image: Vec<u8>,
        observed_at: DateTime<Utc>,
    ) -> Result<Recognition, EngineError> {
        let (outcome, faces) = self.gateway.recognize(image).await?;

        let attendance_recorded = match outcome.identity() {
            Some(identity) => {
                let ledger = Arc::clone(&self.ledger);
                let identity = identity.clone();
                run_storage("attendance", move || ledger.record(&identity, observed_at)).await?
            }
            None => false,
        };

        Ok(Recognition {
            outcome,
            faces,
            attendance_recorded,
        })
    }

    /// Schedule a training run over all current samples.
    pub async fn train(&self) -> Result<TriggerDecision, EngineError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let samples = Arc::clone(&self.samples);
        run_storage("manual training", move || {
            if samples.snapshot()?.is_empty() {
                return Err(EngineError::NoSamples);
            }
            orchestrator.schedule(TriggerReason::Manual)
        })
        .await
    }

    /// Identities with at least one stored sample, sorted by name.
    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        let samples = Arc::clone(&self.samples);
        run_storage("identity listing", move || samples.identities()).await
    }

    pub async fn identity_counts(&self) -> Result<Vec<IdentityCount>, EngineError> {
        let samples = Arc::clone(&self.samples);
        run_storage("identity listing", move || {
            Ok(samples
                .snapshot()?
                .buckets()
                .map(|(identity, refs)| IdentityCount {
                    identity: identity.clone(),
                    samples: refs.len(),
                })
                .collect())
        })
        .await
    }

    pub async fn list_attendance(&self) -> Result<Vec<AttendanceSummary>, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        run_storage("attendance listing", move || ledger.list_attendance()).await
    }

    pub async fn daily_summary(&self, date: NaiveDate) -> Result<DailySummary, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let samples = Arc::clone(&self.samples);
        run_storage("daily summary", move || {
            ledger.daily_summary(date, &samples.identities()?)
        })
        .await
    }

    pub async fn monthly_report(&self, year: i32, month: u32) -> Result<MonthlyReport, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let samples = Arc::clone(&self.samples);
        run_storage("monthly report", move || {
            ledger.monthly_report(year, month, &samples.identities()?)
        })
        .await
    }

    /// Most recent training jobs first.
    pub async fn training_jobs(&self, limit: usize) -> Result<Vec<TrainingJob>, EngineError> {
        let jobs = self.jobs.clone();
        run_storage("job listing", move || jobs.recent(limit)).await
    }

    pub async fn training_job(&self, id: String) -> Result<Option<TrainingJob>, EngineError> {
        let jobs = self.jobs.clone();
        run_storage("job lookup", move || jobs.get(&id)).await
    }

    /// Watch the latest training job as it moves through its states.
    pub fn subscribe_training(&self) -> watch::Receiver<Option<TrainingJob>> {
        self.orchestrator.subscribe()
    }

    pub fn active_model(&self) -> Option<ModelInfo> {
        self.gateway.active_model().map(|handle| ModelInfo {
            version: handle.version,
            trained_at: handle.trained_at,
            identities: handle
                .mapping
                .entries()
                .iter()
                .map(|e| e.identity.clone())
                .collect(),
        })
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let samples = Arc::clone(&self.samples);
        let jobs = self.jobs.clone();
        let (identities, sample_count, last_job) = run_storage("status", move || {
            let snapshot = samples.snapshot()?;
            let last = jobs.recent(1)?.into_iter().next();
            Ok((snapshot.identity_count(), snapshot.sample_count(), last))
        })
        .await?;

        Ok(EngineStatus {
            active_model: self.active_model(),
            identities,
            samples: sample_count,
            last_job,
        })
    }
}

impl<D: FaceDetector, R: FaceRecognizer> Drop for Engine<D, R> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
