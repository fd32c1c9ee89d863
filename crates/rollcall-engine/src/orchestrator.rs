//! Training orchestration: per-identity counters, trigger policy, and the
//! single background worker that turns sample snapshots into models.
//!
//! At most one job runs and at most one job waits. A trigger that arrives
//! while a job is pending refreshes that job's snapshot instead of queueing
//! another; a trigger that arrives while a job runs becomes the pending job.

use crate::db::Database;
use crate::error::EngineError;
use crate::identity::Identity;
use crate::jobs::{JobLog, JobStatus, TrainingJob, TriggerReason};
use crate::label_registry::LabelMapping;
use crate::model_store::{ModelHandle, ModelSlot, ModelStore};
use crate::sample_store::{SampleSnapshot, SampleStore};
use crate::task::{run_blocking, run_storage};
use chrono::Utc;
use rollcall_core::{FaceRecognizer, LabeledFace};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// When a sample count change should trigger retraining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    /// Retrain each time the count passes a multiple of `step`.
    pub step: u64,
    /// Retrain when the count first reaches `cap`.
    pub cap: u64,
}

impl TriggerPolicy {
    /// True when moving from `previous` to `current` crosses a step multiple
    /// or reaches the cap. Each crossing is reported by exactly one call
    /// because counts only move forward under the identity's region.
    pub fn crosses(&self, previous: u64, current: u64) -> bool {
        if current <= previous {
            return false;
        }
        let step_crossed = self.step > 0 && previous / self.step < current / self.step;
        let cap_reached = previous < self.cap && current >= self.cap;
        step_crossed || cap_reached
    }
}

/// Outcome of a sample count update or manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    None,
    Scheduled { job_id: String, coalesced: bool },
}

impl TriggerDecision {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, TriggerDecision::Scheduled { .. })
    }
}

/// Persisted per-identity sample counters plus one exclusive region per identity.
pub struct SampleCounters {
    db: Database,
    regions: Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

impl SampleCounters {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// The exclusive region guarding `identity`'s sample writes and count.
    pub fn region(&self, identity: &Identity) -> Arc<Mutex<()>> {
        let mut regions = self.regions.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(regions.entry(identity.clone()).or_default())
    }

    /// Atomically add `added` and return `(previous, current)`.
    pub fn add(&self, identity: &Identity, added: u64) -> Result<(u64, u64), EngineError> {
        let current: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "INSERT INTO sample_counters (identity, count) VALUES (?1, ?2)
                 ON CONFLICT(identity) DO UPDATE SET count = count + excluded.count
                 RETURNING count",
                params![identity.as_str(), added as i64],
                |row| row.get(0),
            )?)
        })?;
        let current = current as u64;
        Ok((current.saturating_sub(added), current))
    }

    pub fn get(&self, identity: &Identity) -> Result<u64, EngineError> {
        let count: Option<i64> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT count FROM sample_counters WHERE identity = ?1",
                    params![identity.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(count.unwrap_or(0) as u64)
    }
}

struct PendingJob {
    job: TrainingJob,
    snapshot: SampleSnapshot,
}

pub struct TrainingOrchestrator<R: FaceRecognizer> {
    policy: TriggerPolicy,
    counters: SampleCounters,
    jobs: JobLog,
    samples: Arc<SampleStore>,
    models: Arc<ModelStore>,
    slot: Arc<ModelSlot<R::Model>>,
    recognizer: Arc<R>,
    training_timeout: Duration,
    pending: Mutex<Option<PendingJob>>,
    wake: Notify,
    latest: watch::Sender<Option<TrainingJob>>,
}

impl<R: FaceRecognizer> TrainingOrchestrator<R> {
    pub fn new(
        policy: TriggerPolicy,
        db: Database,
        samples: Arc<SampleStore>,
        models: Arc<ModelStore>,
        slot: Arc<ModelSlot<R::Model>>,
        recognizer: Arc<R>,
        training_timeout: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            policy,
            counters: SampleCounters::new(db.clone()),
            jobs: JobLog::new(db),
            samples,
            models,
            slot,
            recognizer,
            training_timeout,
            pending: Mutex::new(None),
            wake: Notify::new(),
            latest,
        }
    }

    pub fn counters(&self) -> &SampleCounters {
        &self.counters
    }

    pub fn jobs(&self) -> &JobLog {
        &self.jobs
    }

    /// Watch the most recently scheduled or updated job.
    pub fn subscribe(&self) -> watch::Receiver<Option<TrainingJob>> {
        self.latest.subscribe()
    }

    /// Count newly written samples and schedule training on a crossing.
    ///
    /// Must be called inside the identity's region, right after the write.
    /// Blocking: a crossing snapshots the sample store.
    pub fn on_samples_added(
        &self,
        identity: &Identity,
        added: u64,
    ) -> Result<(u64, TriggerDecision), EngineError> {
        let (previous, total) = self.counters.add(identity, added)?;
        if !self.policy.crosses(previous, total) {
            return Ok((total, TriggerDecision::None));
        }

        let reason = TriggerReason::Threshold {
            identity: identity.clone(),
            count: total,
        };
        match self.schedule(reason) {
            Ok(decision) => Ok((total, decision)),
            Err(e) => {
                // The samples are stored and counted; only this trigger is lost.
                tracing::error!(identity = %identity, count = total, error = %e, "failed to schedule training");
                Ok((total, TriggerDecision::None))
            }
        }
    }

    /// Snapshot the sample store and queue (or refresh) the pending job.
    /// Blocking.
    ///
    /// The snapshot is taken under the pending lock so a later trigger's
    /// snapshot always supersedes an earlier one.
    pub fn schedule(&self, reason: TriggerReason) -> Result<TriggerDecision, EngineError> {
        let mut pending = self.lock_pending();
        let snapshot = self.samples.snapshot()?;

        if let Some(waiting) = pending.as_mut() {
            waiting.job.identities = snapshot.identity_count();
            waiting.job.samples = snapshot.sample_count();
            waiting.snapshot = snapshot;
            self.jobs.save(&waiting.job)?;
            self.latest.send_replace(Some(waiting.job.clone()));
            tracing::info!(job_id = %waiting.job.id, ?reason, "trigger coalesced into pending training job");
            return Ok(TriggerDecision::Scheduled {
                job_id: waiting.job.id.clone(),
                coalesced: true,
            });
        }

        let job = TrainingJob::new(reason, snapshot.identity_count(), snapshot.sample_count());
        self.jobs.save(&job)?;
        self.latest.send_replace(Some(job.clone()));
        let job_id = job.id.clone();
        tracing::info!(
            job_id = %job_id,
            reason = ?job.reason,
            identities = job.identities,
            samples = job.samples,
            "training job scheduled"
        );

        *pending = Some(PendingJob { job, snapshot });
        drop(pending);
        self.wake.notify_one();

        Ok(TriggerDecision::Scheduled {
            job_id,
            coalesced: false,
        })
    }

    /// Start the background worker. Jobs run one at a time, in trigger order.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("training worker started");
            loop {
                this.wake.notified().await;
                while let Some(pending) = this.take_pending() {
                    this.run(pending).await;
                }
            }
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingJob>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_pending(&self) -> Option<PendingJob> {
        self.lock_pending().take()
    }

    async fn run(&self, pending: PendingJob) {
        let PendingJob { mut job, snapshot } = pending;

        job.status = JobStatus::Running;
        self.record(&job).await;
        tracing::info!(job_id = %job.id, identities = job.identities, samples = job.samples, "training job started");

        match self.train(snapshot).await {
            Ok(version) => {
                job.status = JobStatus::Succeeded;
                job.model_version = Some(version);
                tracing::info!(job_id = %job.id, version, "training job succeeded");
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                tracing::error!(job_id = %job.id, error = %e, "training job failed; active model unchanged");
            }
        }

        job.finished_at = Some(Utc::now());
        self.record(&job).await;
    }

    async fn record(&self, job: &TrainingJob) {
        let log = self.jobs.clone();
        let row = job.clone();
        if let Err(e) = run_storage("job log", move || log.save(&row)).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to persist job status");
        }
        self.latest.send_replace(Some(job.clone()));
    }

    async fn train(&self, snapshot: SampleSnapshot) -> Result<u64, EngineError> {
        if snapshot.is_empty() {
            return Err(EngineError::NoSamples);
        }

        let samples = Arc::clone(&self.samples);
        let (mapping, faces) =
            run_storage("sample load", move || load_training_set(&samples, &snapshot)).await?;
        if faces.is_empty() {
            return Err(EngineError::NoSamples);
        }

        let recognizer = Arc::clone(&self.recognizer);
        let sample_count = faces.len();
        let model = run_blocking("training", self.training_timeout, move || {
            recognizer
                .train(&faces)
                .map_err(|e| EngineError::TrainingBackend(e.to_string()))
        })
        .await
        .map_err(|e| match e {
            EngineError::TrainingBackend(_) => e,
            other => EngineError::TrainingBackend(other.to_string()),
        })?;

        let models = Arc::clone(&self.models);
        let handle = run_storage("model publish", move || {
            let handle = ModelHandle {
                version: models.next_version()?,
                trained_at: Utc::now(),
                model,
                mapping,
            };
            models.publish(&handle)?;
            Ok(handle)
        })
        .await?;

        let version = handle.version;
        let labels = handle.mapping.len();
        let previous = self.slot.publish(handle).map(|h| h.version);
        tracing::info!(version, ?previous, labels, samples = sample_count, "model published");
        Ok(version)
    }
}

/// Load every snapshotted sample and label it through one fresh mapping.
/// Identities whose samples all fail to load are left out of the mapping.
fn load_training_set(
    store: &SampleStore,
    snapshot: &SampleSnapshot,
) -> Result<(LabelMapping, Vec<LabeledFace>), EngineError> {
    let mut loaded = Vec::with_capacity(snapshot.identity_count());
    for (identity, refs) in snapshot.buckets() {
        let mut faces = Vec::with_capacity(refs.len());
        for sample in refs {
            match store.load(sample) {
                Ok(face) => faces.push(face),
                Err(e) => {
                    tracing::warn!(path = %sample.path.display(), error = %e, "skipping unreadable sample")
                }
            }
        }
        if !faces.is_empty() {
            loaded.push((identity.clone(), faces));
        }
    }

    let mapping = LabelMapping::snapshot(loaded.iter().map(|(id, _)| id));
    let mut set = Vec::new();
    for (identity, faces) in loaded {
        let label = mapping
            .label_of(&identity)
            .ok_or_else(|| EngineError::Storage(format!("no label for {identity}")))?;
        set.extend(faces.into_iter().map(|face| LabeledFace { label, face }));
    }
    Ok((mapping, set))
}
