//! Small pool of ONNX sessions shared by concurrent callers.

use crate::error::VisionError;
use ort::session::Session;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct SessionPool {
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
    output_names: Vec<String>,
}

impl SessionPool {
    /// Load `size` independent sessions of the same model (at least one).
    pub(crate) fn load(model_path: &str, size: usize) -> Result<Self, VisionError> {
        if !Path::new(model_path).exists() {
            return Err(VisionError::ModelNotFound(model_path.to_string()));
        }

        let size = size.max(1);
        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            let session = Session::builder()?
                .with_intra_threads(2)?
                .commit_from_file(model_path)?;
            sessions.push(session);
        }

        let output_names = sessions[0]
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            sessions = size,
            inputs = ?sessions[0].inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            output_names,
        })
    }

    pub(crate) fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Run `f` on a free session, blocking on the round-robin slot if all are busy.
    pub(crate) fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, VisionError>,
    ) -> Result<T, VisionError> {
        let n = self.sessions.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for i in 0..n {
            if let Ok(mut session) = self.sessions[(start + i) % n].try_lock() {
                return f(&mut session);
            }
        }

        let mut session = self.sessions[start % n]
            .lock()
            .map_err(|_| VisionError::InferenceFailed("session lock poisoned".into()))?;
        f(&mut session)
    }
}
