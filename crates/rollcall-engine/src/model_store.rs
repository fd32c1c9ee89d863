//! Versioned model artifacts and the active-model slot.
//!
//! Each version lives in `<root>/vNNNNNN/` with `model.json`, `labels.json`
//! and a `manifest.json` carrying SHA-256 digests of both. A version is
//! staged under a hidden name and renamed into place; `<root>/CURRENT`
//! names the active version and is itself replaced by rename.

use crate::error::EngineError;
use crate::label_registry::LabelMapping;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const MODEL_FILE: &str = "model.json";
const LABELS_FILE: &str = "labels.json";
const MANIFEST_FILE: &str = "manifest.json";
const CURRENT_FILE: &str = "CURRENT";

/// A trained model paired with the label mapping it was trained against.
#[derive(Debug)]
pub struct ModelHandle<M> {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub model: M,
    pub mapping: LabelMapping,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u64,
    trained_at: DateTime<Utc>,
    labels: usize,
    model_sha256: String,
    labels_sha256: String,
}

pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn version_dir(&self, version: u64) -> PathBuf {
        self.root.join(format!("v{version:06}"))
    }

    /// Published versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, EngineError> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            if let Some(v) = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn next_version(&self) -> Result<u64, EngineError> {
        Ok(self.versions()?.last().map_or(1, |v| v + 1))
    }

    /// Write a complete version directory and point `CURRENT` at it.
    pub fn publish<M: Serialize>(&self, handle: &ModelHandle<M>) -> Result<(), EngineError> {
        let model_json = serde_json::to_vec(&handle.model)?;
        let labels_json = serde_json::to_vec_pretty(&handle.mapping)?;
        let manifest = Manifest {
            version: handle.version,
            trained_at: handle.trained_at,
            labels: handle.mapping.len(),
            model_sha256: sha256_hex(&model_json),
            labels_sha256: sha256_hex(&labels_json),
        };

        let target = self.version_dir(handle.version);
        if target.exists() {
            return Err(EngineError::Storage(format!(
                "model version {} already exists",
                handle.version
            )));
        }

        let staging = self
            .root
            .join(format!(".staging-{}-{}", handle.version, uuid::Uuid::new_v4()));
        let staged = (|| -> Result<(), EngineError> {
            fs::create_dir_all(&staging)?;
            fs::write(staging.join(MODEL_FILE), &model_json)?;
            fs::write(staging.join(LABELS_FILE), &labels_json)?;
            fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
            fs::rename(&staging, &target)?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let current_tmp = self.root.join(format!(".{CURRENT_FILE}.tmp"));
        fs::write(&current_tmp, handle.version.to_string())?;
        fs::rename(&current_tmp, self.root.join(CURRENT_FILE))?;

        tracing::info!(
            version = handle.version,
            labels = handle.mapping.len(),
            path = %target.display(),
            "model version persisted"
        );
        Ok(())
    }

    /// The version named by `CURRENT`, if any.
    pub fn current_version(&self) -> Result<Option<u64>, EngineError> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| EngineError::CorruptModel(format!("CURRENT holds {s:?}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load and verify one version.
    pub fn load<M: DeserializeOwned>(&self, version: u64) -> Result<ModelHandle<M>, EngineError> {
        let dir = self.version_dir(version);
        let manifest: Manifest = serde_json::from_slice(&read(&dir, MANIFEST_FILE)?)?;
        let model_json = read(&dir, MODEL_FILE)?;
        let labels_json = read(&dir, LABELS_FILE)?;

        if manifest.version != version {
            return Err(EngineError::CorruptModel(format!(
                "v{version}: manifest names version {}",
                manifest.version
            )));
        }
        if sha256_hex(&model_json) != manifest.model_sha256 {
            return Err(EngineError::CorruptModel(format!("v{version}: model digest mismatch")));
        }
        if sha256_hex(&labels_json) != manifest.labels_sha256 {
            return Err(EngineError::CorruptModel(format!("v{version}: labels digest mismatch")));
        }

        Ok(ModelHandle {
            version,
            trained_at: manifest.trained_at,
            model: serde_json::from_slice(&model_json)?,
            mapping: serde_json::from_slice(&labels_json)?,
        })
    }

    /// The model to serve at startup: `CURRENT` if it loads, otherwise the
    /// newest version that does.
    pub fn load_latest<M: DeserializeOwned>(&self) -> Result<Option<ModelHandle<M>>, EngineError> {
        let mut candidates = self.versions()?;
        candidates.reverse();
        if let Some(current) = self.current_version().unwrap_or(None) {
            candidates.retain(|v| *v != current);
            candidates.insert(0, current);
        }

        for version in candidates {
            match self.load(version) {
                Ok(handle) => return Ok(Some(handle)),
                Err(e) => tracing::warn!(version, error = %e, "skipping unloadable model version"),
            }
        }
        Ok(None)
    }
}

fn read(dir: &Path, file: &str) -> Result<Vec<u8>, EngineError> {
    Ok(fs::read(dir.join(file))?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// The active model, shared by all recognition requests.
///
/// Readers clone the `Arc` and keep using that handle (model and mapping
/// together) for the whole request; publishing replaces the pointer.
pub struct ModelSlot<M> {
    active: RwLock<Option<Arc<ModelHandle<M>>>>,
}

impl<M> ModelSlot<M> {
    pub fn new(initial: Option<ModelHandle<M>>) -> Self {
        Self {
            active: RwLock::new(initial.map(Arc::new)),
        }
    }

    pub fn current(&self) -> Option<Arc<ModelHandle<M>>> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new handle, returning the superseded one.
    pub fn publish(&self, handle: ModelHandle<M>) -> Option<Arc<ModelHandle<M>>> {
        let handle = Arc::new(handle);
        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.replace(handle)
    }
}
