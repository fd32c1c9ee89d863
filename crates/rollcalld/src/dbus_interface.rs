use chrono::{NaiveDate, Utc};
use rollcall_core::{ArcFaceRecognizer, ScrfdDetector};
use rollcall_engine::{Engine, EngineError};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub type DaemonEngine = Engine<ScrfdDetector, ArcFaceRecognizer>;

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Structured results are returned as JSON strings.
pub struct RollcallService {
    engine: Arc<DaemonEngine>,
}

impl RollcallService {
    pub fn new(engine: Arc<DaemonEngine>) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Store every face in `image` as a sample of `identity`.
    async fn enroll(&self, identity: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity, bytes = image.len(), "enroll requested");
        to_json(&self.engine.enroll(identity, image).await.map_err(to_fdo)?)
    }

    /// Recognize the faces in `image` and record attendance for a match.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "recognize requested");
        to_json(&self.engine.recognize(image).await.map_err(to_fdo)?)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<Vec<String>> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        Ok(identities.into_iter().map(String::from).collect())
    }

    /// Per-identity sample counts.
    async fn identity_counts(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.identity_counts().await.map_err(to_fdo)?)
    }

    async fn list_attendance(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.list_attendance().await.map_err(to_fdo)?)
    }

    /// Present and absent identities on `date` (YYYY-MM-DD, UTC). Empty means today.
    async fn daily_summary(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            Utc::now().date_naive()
        } else {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date {date:?}: {e}")))?
        };
        to_json(&self.engine.daily_summary(date).await.map_err(to_fdo)?)
    }

    async fn monthly_report(&self, year: i32, month: u32) -> zbus::fdo::Result<String> {
        to_json(&self.engine.monthly_report(year, month).await.map_err(to_fdo)?)
    }

    /// Schedule a training run over all current samples.
    async fn train(&self) -> zbus::fdo::Result<String> {
        tracing::info!("manual training requested");
        to_json(&self.engine.train().await.map_err(to_fdo)?)
    }

    async fn training_jobs(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(&self.engine.training_jobs(limit as usize).await.map_err(to_fdo)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    if err.is_caller_fault() {
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        zbus::fdo::Error::Failed(err.to_string())
    }
}
