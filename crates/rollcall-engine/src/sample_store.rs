//! Per-identity face sample buckets on disk.
//!
//! Layout: `<root>/<identity>/<uuid>.png`, 8-bit grayscale at the canonical
//! sample size. Files are written under a hidden temporary name and renamed
//! into place, so a listing never observes a half-written sample.

use crate::error::EngineError;
use crate::identity::Identity;
use image::{GrayImage, ImageFormat};
use rollcall_core::{normalize_face, FaceDetector};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SAMPLE_EXTENSION: &str = "png";

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleRef {
    pub identity: Identity,
    pub path: PathBuf,
}

/// The sample set of every identity with at least one sample, frozen at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSnapshot {
    buckets: BTreeMap<Identity, Vec<SampleRef>>,
}

impl SampleSnapshot {
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.buckets.keys()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&Identity, &[SampleRef])> {
        self.buckets.iter().map(|(id, s)| (id, s.as_slice()))
    }

    pub fn identity_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn sample_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn bucket(&self, identity: &Identity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    /// Persist normalized crops for `identity`, creating its bucket if absent.
    ///
    /// All or nothing: if any write fails, the crops already written by this
    /// call are removed before the error is returned.
    pub fn write_samples(
        &self,
        identity: &Identity,
        crops: &[GrayImage],
    ) -> Result<Vec<SampleRef>, EngineError> {
        let bucket = self.bucket(identity);
        fs::create_dir_all(&bucket)?;

        let mut written = Vec::with_capacity(crops.len());
        for crop in crops {
            match write_atomic(&bucket, crop) {
                Ok(path) => written.push(SampleRef {
                    identity: identity.clone(),
                    path,
                }),
                Err(e) => {
                    self.discard(&written);
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Best-effort removal of samples written by a failed request.
    pub fn discard(&self, samples: &[SampleRef]) {
        for sample in samples {
            if let Err(e) = fs::remove_file(&sample.path) {
                tracing::warn!(path = %sample.path.display(), error = %e, "failed to remove sample");
            }
        }
    }

    /// Samples of one identity, ordered by file name.
    pub fn samples(&self, identity: &Identity) -> Result<Vec<SampleRef>, EngineError> {
        let bucket = self.bucket(identity);
        let entries = match fs::read_dir(&bucket) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if is_sample_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| SampleRef {
                identity: identity.clone(),
                path,
            })
            .collect())
    }

    /// Identities with at least one sample, sorted by name.
    pub fn identities(&self) -> Result<Vec<Identity>, EngineError> {
        Ok(self.snapshot()?.buckets.into_keys().collect())
    }

    /// Freeze the current sample set. Bucket names that are not valid
    /// identities are ignored.
    pub fn snapshot(&self) -> Result<SampleSnapshot, EngineError> {
        let mut buckets = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(identity) = entry
                .file_name()
                .to_str()
                .and_then(|name| Identity::parse(name).ok())
            else {
                continue;
            };
            let samples = self.samples(&identity)?;
            if !samples.is_empty() {
                buckets.insert(identity, samples);
            }
        }
        Ok(SampleSnapshot { buckets })
    }

    pub fn load(&self, sample: &SampleRef) -> Result<GrayImage, EngineError> {
        Ok(image::open(&sample.path)?.to_luma8())
    }
}

/// Detect faces in `image` and normalize each one to a canonical crop.
pub(crate) fn crop_faces<D: FaceDetector + ?Sized>(
    detector: &D,
    image: &GrayImage,
) -> Result<Vec<GrayImage>, EngineError> {
    let boxes = detector.detect(image)?;
    let crops: Vec<GrayImage> = boxes
        .iter()
        .filter_map(|face| normalize_face(image, face))
        .collect();
    tracing::debug!(detected = boxes.len(), usable = crops.len(), "faces cropped");
    Ok(crops)
}

fn write_atomic(bucket: &Path, crop: &GrayImage) -> Result<PathBuf, EngineError> {
    let name = format!("{}.{SAMPLE_EXTENSION}", uuid::Uuid::new_v4());
    let tmp = bucket.join(format!(".{name}.tmp"));
    let target = bucket.join(&name);

    let result = crop
        .save_with_format(&tmp, ImageFormat::Png)
        .map_err(EngineError::from)
        .and_then(|()| fs::rename(&tmp, &target).map_err(EngineError::from));

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map(|()| target)
}

fn is_sample_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().and_then(|e| e.to_str()) == Some(SAMPLE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn id(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn crop(v: u8) -> GrayImage {
        GrayImage::from_pixel(112, 112, Luma([v]))
    }

    #[test]
    fn test_write_creates_bucket_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();

        let written = store.write_samples(&id("ana"), &[crop(10), crop(20)]).unwrap();
        assert_eq!(written.len(), 2);
        assert!(store.bucket(&id("ana")).is_dir());
        assert_eq!(store.samples(&id("ana")).unwrap().len(), 2);

        let loaded = store.load(&written[0]).unwrap();
        assert_eq!(loaded.dimensions(), (112, 112));
    }

    #[test]
    fn test_snapshot_skips_empty_and_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        store.write_samples(&id("bob"), &[crop(1)]).unwrap();
        store.write_samples(&id("ana"), &[crop(2)]).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::create_dir_all(dir.path().join(".trash")).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(store.bucket(&id("ana")).join(".partial.png.tmp"), b"x").unwrap();

        let snap = store.snapshot().unwrap();
        let names: Vec<_> = snap.identities().map(Identity::as_str).collect();
        assert_eq!(names, vec!["ana", "bob"]);
        assert_eq!(snap.sample_count(), 2);
    }

    #[test]
    fn test_samples_of_unknown_identity_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        assert!(store.samples(&id("nobody")).unwrap().is_empty());
    }

    #[test]
    fn test_discard_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        let written = store.write_samples(&id("ana"), &[crop(1)]).unwrap();
        store.discard(&written);
        assert!(store.samples(&id("ana")).unwrap().is_empty());
        assert!(store.snapshot().unwrap().is_empty());
    }
}
