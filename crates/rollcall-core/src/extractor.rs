//! Face embedding extraction contract and its ONNX-backed implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detection model file name.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// Detects faces in an image and turns each into an embedding.
///
/// Implementations must be deterministic for a given image.
pub trait FaceExtractor {
    /// Face regions ordered by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractorError>;

    /// One embedding per region, in the same order as `faces`.
    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, ExtractorError>;

    /// Detect then encode every face in the image.
    fn extract_all(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractorError> {
        let faces = self.detect(image)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(image, &faces)
    }
}

impl<T: FaceExtractor + ?Sized> FaceExtractor for &mut T {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractorError> {
        (**self).detect(image)
    }

    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, ExtractorError> {
        (**self).encode(image, faces)
    }
}

/// SCRFD + ArcFace running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, threads: usize) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL), threads)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL), threads)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractorError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, ExtractorError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(ExtractorError::from))
            .collect()
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
