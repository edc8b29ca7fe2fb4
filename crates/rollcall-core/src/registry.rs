//! Student registration: validates photos and files them in the enrollment
//! image directory as `<Identity>_<n>.jpg`.

use crate::extractor::FaceExtractor;
use crate::store::{BuildReport, EncodingStore, EnrollmentWarning, StoreError};
use crate::types::Identity;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid student name '{0}'")]
    InvalidName(String),
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Photos accepted and rejected by one enrollment.
#[derive(Debug)]
pub struct EnrollOutcome {
    pub identity: Identity,
    pub saved: Vec<PathBuf>,
    pub rejected: Vec<EnrollmentWarning>,
}

/// The enrollment image directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build an encoding store snapshot of the current image set.
    pub fn build_store<E>(&self, extractor: &mut E) -> Result<BuildReport, StoreError>
    where
        E: FaceExtractor + ?Sized,
    {
        EncodingStore::build(&self.dir, extractor)
    }

    /// Register `photos` for the student `name`.
    ///
    /// Photos without a detectable face are rejected and reported; the rest
    /// are saved as JPEG with indices continuing after the student's highest
    /// existing one.
    pub fn enroll<E>(&self, extractor: &mut E, name: &str, photos: &[PathBuf]) -> Result<EnrollOutcome, RegistryError>
    where
        E: FaceExtractor + ?Sized,
    {
        let identity = validate_name(name)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut next = self.next_index(&identity)?;
        let mut saved = Vec::new();
        let mut rejected = Vec::new();

        for photo in photos {
            let image = match image::open(photo) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    rejected.push(EnrollmentWarning::Unreadable {
                        path: photo.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match extractor.detect(&image) {
                Ok(faces) if faces.is_empty() => {
                    rejected.push(EnrollmentWarning::NoFace { path: photo.clone() });
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    rejected.push(EnrollmentWarning::ExtractionFailed {
                        path: photo.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            let mut target = self.photo_path(&identity, next);
            while target.exists() {
                next += 1;
                target = self.photo_path(&identity, next);
            }
            image
                .save_with_format(&target, ImageFormat::Jpeg)
                .map_err(|source| RegistryError::Save {
                    path: target.clone(),
                    source,
                })?;
            tracing::info!(student = %identity, from = %photo.display(), to = %target.display(), "photo enrolled");
            saved.push(target);
            next += 1;
        }

        for warning in &rejected {
            tracing::warn!(%warning, "photo rejected");
        }

        Ok(EnrollOutcome {
            identity,
            saved,
            rejected,
        })
    }

    /// Smallest index above every existing `<identity>_<n>.<ext>` photo.
    pub fn next_index(&self, identity: &Identity) -> Result<u32, RegistryError> {
        if !self.dir.exists() {
            return Ok(1);
        }
        let io_err = |source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        };
        let prefix = format!("{identity}_");
        let mut highest = 0u32;
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !crate::store::is_enrollment_image(&path) {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(&prefix))
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                highest = highest.max(index);
            }
        }
        Ok(highest + 1)
    }

    fn photo_path(&self, identity: &Identity, index: u32) -> PathBuf {
        self.dir.join(format!("{identity}_{index}.jpg"))
    }
}

fn validate_name(name: &str) -> Result<Identity, RegistryError> {
    let trimmed = name.trim();
    let unsafe_name = trimmed.contains(['/', '\\', '\0']) || trimmed == "." || trimmed == "..";
    match Identity::new(trimmed) {
        Some(identity) if !unsafe_name => Ok(identity),
        _ => Err(RegistryError::InvalidName(name.to_string())),
    }
}
