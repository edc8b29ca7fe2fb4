//! Encoding store: the (identity, embedding) snapshot built from the
//! enrollment image directory.
//!
//! The store is an immutable value. It is rebuilt wholesale whenever the
//! image set changes; [`EncodingStore::is_current`] tells callers whether a
//! snapshot still matches its directory.

use crate::extractor::FaceExtractor;
use crate::types::{EncodingRecord, Identity};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// File extensions accepted as enrollment images (case-insensitive).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read image directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A non-fatal problem with one enrollment image. The image is left out of
/// the store and the build continues.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentWarning {
    Unreadable { path: PathBuf, reason: String },
    NoFace { path: PathBuf },
    ExtractionFailed { path: PathBuf, reason: String },
    InvalidName { path: PathBuf },
    DimensionMismatch { path: PathBuf, expected: usize, actual: usize },
}

impl EnrollmentWarning {
    pub fn path(&self) -> &Path {
        match self {
            Self::Unreadable { path, .. }
            | Self::NoFace { path }
            | Self::ExtractionFailed { path, .. }
            | Self::InvalidName { path }
            | Self::DimensionMismatch { path, .. } => path,
        }
    }
}

impl fmt::Display for EnrollmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable { path, reason } => write!(f, "{}: unreadable image ({reason})", path.display()),
            Self::NoFace { path } => write!(f, "{}: no face detected", path.display()),
            Self::ExtractionFailed { path, reason } => {
                write!(f, "{}: face processing failed ({reason})", path.display())
            }
            Self::InvalidName { path } => write!(f, "{}: file name yields no student name", path.display()),
            Self::DimensionMismatch { path, expected, actual } => write!(
                f,
                "{}: embedding has {actual} dimensions, store has {expected}",
                path.display()
            ),
        }
    }
}

/// SHA-256 over the names, sizes and modification times of the eligible
/// images in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusFingerprint(String);

impl CorpusFingerprint {
    fn of(entries: &[ImageEntry]) -> Self {
        let mut hasher = Sha256::new();
        for entry in entries {
            hasher.update(entry.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.len.to_le_bytes());
            hasher.update(entry.modified_nanos.to_le_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorpusFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

/// Ordered (identity, embedding) records. Order is file-name order, which
/// the first-hit matcher depends on. Every record has the same embedding
/// dimension, fixed by the first record.
#[derive(Debug, Clone)]
pub struct EncodingStore {
    records: Vec<EncodingRecord>,
    dim: Option<usize>,
    fingerprint: CorpusFingerprint,
}

/// Outcome of [`EncodingStore::build`]: the store plus every image that
/// was skipped and why.
#[derive(Debug)]
pub struct BuildReport {
    pub store: EncodingStore,
    pub warnings: Vec<EnrollmentWarning>,
}

impl BuildReport {
    /// True when at least one eligible image was left out.
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

impl EncodingStore {
    /// Build a store from every `.jpg`/`.jpeg`/`.png` file in `dir`.
    ///
    /// Images are visited in file-name order. Only the first detected face
    /// of each image is enrolled. A missing directory yields an empty store.
    pub fn build<E>(dir: &Path, extractor: &mut E) -> Result<BuildReport, StoreError>
    where
        E: FaceExtractor + ?Sized,
    {
        let entries = list_images(dir)?;
        let fingerprint = CorpusFingerprint::of(&entries);
        let mut records = Vec::with_capacity(entries.len());
        let mut warnings = Vec::new();

        let mut dim = None;

        for entry in &entries {
            let enrolled = enroll_image(&entry.path, extractor).and_then(|record| {
                let actual = record.embedding.dim();
                match *dim.get_or_insert(actual) {
                    expected if expected == actual => Ok(record),
                    expected => Err(EnrollmentWarning::DimensionMismatch {
                        path: entry.path.clone(),
                        expected,
                        actual,
                    }),
                }
            });
            match enrolled {
                Ok(record) => records.push(record),
                Err(warning) => {
                    tracing::warn!(%warning, "skipping enrollment image");
                    warnings.push(warning);
                }
            }
        }

        let store = Self { records, dim, fingerprint };
        tracing::info!(
            dir = %dir.display(),
            images = entries.len(),
            records = store.len(),
            students = store.roster().len(),
            skipped = warnings.len(),
            fingerprint = %store.fingerprint,
            "encoding store built"
        );

        Ok(BuildReport { store, warnings })
    }

    /// Store over pre-extracted records, kept in the given order. Records
    /// with an empty embedding, or whose dimension differs from the first
    /// kept record, are dropped.
    pub fn from_records(records: Vec<EncodingRecord>) -> Self {
        let mut dim = None;
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| !r.embedding.is_empty())
            .filter(|r| {
                let expected = *dim.get_or_insert(r.embedding.dim());
                if expected != r.embedding.dim() {
                    tracing::warn!(
                        identity = %r.identity,
                        source = %r.source.display(),
                        expected,
                        actual = r.embedding.dim(),
                        "dropping record with mismatched embedding dimension"
                    );
                }
                expected == r.embedding.dim()
            })
            .collect();
        Self {
            records,
            dim,
            fingerprint: CorpusFingerprint::of(&[]),
        }
    }

    /// Embedding dimension shared by every record; `None` when empty.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn records(&self) -> &[EncodingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fingerprint(&self) -> &CorpusFingerprint {
        &self.fingerprint
    }

    /// Every distinct enrolled identity.
    pub fn identities(&self) -> BTreeSet<Identity> {
        self.records.iter().map(|r| r.identity.clone()).collect()
    }

    /// Identity → number of enrolled photos.
    pub fn roster(&self) -> BTreeMap<Identity, usize> {
        let mut roster = BTreeMap::new();
        for record in &self.records {
            *roster.entry(record.identity.clone()).or_insert(0) += 1;
        }
        roster
    }

    /// Whether `dir` still holds the image set this store was built from.
    pub fn is_current(&self, dir: &Path) -> Result<bool, StoreError> {
        Ok(CorpusFingerprint::of(&list_images(dir)?) == self.fingerprint)
    }
}

/// Whether `path` has one of the accepted image extensions.
pub fn is_enrollment_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

struct ImageEntry {
    path: PathBuf,
    name: String,
    len: u64,
    modified_nanos: u128,
}

/// Eligible image files in `dir`, sorted by file name.
fn list_images(dir: &Path) -> Result<Vec<ImageEntry>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let read_err = |source| StoreError::ReadDir { path: dir.to_path_buf(), source };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if !is_enrollment_image(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        entries.push(ImageEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            len: meta.len(),
            modified_nanos,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn enroll_image<E>(path: &Path, extractor: &mut E) -> Result<EncodingRecord, EnrollmentWarning>
where
    E: FaceExtractor + ?Sized,
{
    let identity = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(Identity::from_stem)
        .ok_or_else(|| EnrollmentWarning::InvalidName { path: path.to_path_buf() })?;

    let image = image::open(path)
        .map_err(|e| EnrollmentWarning::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .to_rgb8();

    let failed = |reason: String| EnrollmentWarning::ExtractionFailed {
        path: path.to_path_buf(),
        reason,
    };

    let faces = extractor.detect(&image).map_err(|e| failed(e.to_string()))?;
    let Some(first) = faces.first() else {
        return Err(EnrollmentWarning::NoFace { path: path.to_path_buf() });
    };
    if faces.len() > 1 {
        tracing::debug!(path = %path.display(), faces = faces.len(), "enrollment image has several faces, using the first");
    }

    let embedding = extractor
        .encode(&image, std::slice::from_ref(first))
        .map_err(|e| failed(e.to_string()))?
        .into_iter()
        .next()
        .filter(|e| !e.is_empty())
        .ok_or_else(|| failed("extractor returned no embedding".into()))?;

    Ok(EncodingRecord {
        identity,
        embedding,
        source: path.to_path_buf(),
    })
}
