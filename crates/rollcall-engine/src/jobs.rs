//! Training job records and their persisted history.

use crate::db::Database;
use crate::error::EngineError;
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a training job was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerReason {
    /// An identity's sample count crossed a training step or the cap.
    Threshold { identity: Identity, count: u64 },
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EngineError::Storage(format!("unknown job status {other:?}"))),
        }
    }
}

/// One retraining attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingJob {
    pub id: String,
    pub reason: TriggerReason,
    pub status: JobStatus,
    /// Identities in the job's sample snapshot.
    pub identities: usize,
    /// Samples in the job's sample snapshot.
    pub samples: usize,
    pub model_version: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    pub fn new(reason: TriggerReason, identities: usize, samples: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reason,
            status: JobStatus::Pending,
            identities,
            samples,
            model_version: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Persisted job history in the `training_jobs` table.
#[derive(Clone)]
pub struct JobLog {
    db: Database,
}

impl JobLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the full job row.
    pub fn save(&self, job: &TrainingJob) -> Result<(), EngineError> {
        let reason = serde_json::to_string(&job.reason)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO training_jobs
                    (id, reason, status, identities, samples, model_version, error, created_at_ms, finished_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    identities = excluded.identities,
                    samples = excluded.samples,
                    model_version = excluded.model_version,
                    error = excluded.error,
                    finished_at_ms = excluded.finished_at_ms",
                params![
                    job.id,
                    reason,
                    job.status.as_str(),
                    job.identities as i64,
                    job.samples as i64,
                    job.model_version.map(|v| v as i64),
                    job.error,
                    job.created_at.timestamp_millis(),
                    job.finished_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<TrainingJob>, EngineError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, reason, status, identities, samples, model_version, error, created_at_ms, finished_at_ms
                 FROM training_jobs WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Most recent jobs first.
    pub fn recent(&self, limit: usize) -> Result<Vec<TrainingJob>, EngineError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, reason, status, identities, samples, model_version, error, created_at_ms, finished_at_ms
                 FROM training_jobs ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], read_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row??);
            }
            Ok(jobs)
        })
    }

    /// Mark jobs left pending or running by a previous process as failed.
    pub fn fail_interrupted(&self) -> Result<usize, EngineError> {
        let now = Utc::now().timestamp_millis();
        let n = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE training_jobs
                 SET status = 'failed', error = 'interrupted by restart', finished_at_ms = ?1
                 WHERE status IN ('pending', 'running')",
                params![now],
            )?)
        })?;
        if n > 0 {
            tracing::warn!(jobs = n, "marked interrupted training jobs as failed");
        }
        Ok(n)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<TrainingJob, EngineError>> {
    let reason: String = row.get(1)?;
    let status: String = row.get(2)?;
    let identities: i64 = row.get(3)?;
    let samples: i64 = row.get(4)?;
    let model_version: Option<i64> = row.get(5)?;
    let created_at_ms: i64 = row.get(7)?;
    let finished_at_ms: Option<i64> = row.get(8)?;
    let id: String = row.get(0)?;
    let error: Option<String> = row.get(6)?;

    Ok((|| -> Result<TrainingJob, EngineError> {
        Ok(TrainingJob {
            id,
            reason: serde_json::from_str(&reason)?,
            status: status.parse()?,
            identities: identities as usize,
            samples: samples as usize,
            model_version: model_version.map(|v| v as u64),
            error,
            created_at: millis_to_utc(created_at_ms)?,
            finished_at: finished_at_ms.map(millis_to_utc).transpose()?,
        })
    })())
}

pub(crate) fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, EngineError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::Storage(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> JobLog {
        JobLog::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_save_and_get() {
        let log = log();
        let reason = TriggerReason::Threshold {
            identity: Identity::parse("ana").unwrap(),
            count: 200,
        };
        let mut job = TrainingJob::new(reason.clone(), 1, 200);
        log.save(&job).unwrap();

        job.status = JobStatus::Succeeded;
        job.model_version = Some(3);
        job.finished_at = Some(Utc::now());
        log.save(&job).unwrap();

        let got = log.get(&job.id).unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Succeeded);
        assert_eq!(got.model_version, Some(3));
        assert_eq!(got.reason, reason);
        assert!(log.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_recent_orders_newest_first() {
        let log = log();
        let first = TrainingJob::new(TriggerReason::Manual, 0, 0);
        let mut second = TrainingJob::new(TriggerReason::Manual, 0, 0);
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        log.save(&first).unwrap();
        log.save(&second).unwrap();

        let jobs = log.recent(10).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(log.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_fail_interrupted() {
        let log = log();
        let mut running = TrainingJob::new(TriggerReason::Manual, 1, 1);
        running.status = JobStatus::Running;
        let mut done = TrainingJob::new(TriggerReason::Manual, 1, 1);
        done.status = JobStatus::Succeeded;
        log.save(&running).unwrap();
        log.save(&done).unwrap();

        assert_eq!(log.fail_interrupted().unwrap(), 1);
        let got = log.get(&running.id).unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Failed);
        assert_eq!(got.error.as_deref(), Some("interrupted by restart"));
        assert_eq!(log.get(&done.id).unwrap().unwrap().status, JobStatus::Succeeded);
    }
}
