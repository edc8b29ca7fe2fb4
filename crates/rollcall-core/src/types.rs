use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A student's canonical name; the grouping key for enrollment and attendance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` for an empty (or whitespace-only) name.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            None
        } else {
            Some(Self(name))
        }
    }

    /// Derive an identity from an image file stem.
    ///
    /// A trailing `_<digits>` suffix is stripped so `Alice_3` and `Alice`
    /// both map to `Alice`. A stem that would become empty is kept whole.
    pub fn from_stem(stem: &str) -> Option<Self> {
        let base = match stem.rsplit_once('_') {
            Some((base, suffix))
                if !base.is_empty()
                    && !suffix.is_empty()
                    && suffix.bytes().all(|b| b.is_ascii_digit()) =>
            {
                base
            }
            _ => stem,
        };
        Self::new(base)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One enrolled image's embedding, tagged with the student it belongs to.
#[derive(Debug, Clone)]
pub struct EncodingRecord {
    pub identity: Identity,
    pub embedding: Embedding,
    /// Image file the embedding was extracted from.
    pub source: PathBuf,
}

/// Unique identities detected in one scan, in lexicographic order.
pub type AttendanceSet = BTreeSet<Identity>;

/// A single match produced while scanning a video. Never persisted.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub identity: Identity,
    /// 1-based index of the frame in the video stream.
    pub frame_index: u64,
    /// Position of the frame in the video.
    pub timestamp: Duration,
    /// Euclidean distance to the matched record.
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_distance_across_dimensions_is_infinite() {
        let stored = Embedding::new(vec![0.0, 100.0]);
        assert_eq!(Embedding::new(vec![0.0]).euclidean_distance(&stored), f32::INFINITY);
        assert_eq!(Embedding::new(Vec::new()).euclidean_distance(&stored), f32::INFINITY);
    }

    #[test]
    fn test_identity_strips_numeric_suffix() {
        assert_eq!(Identity::from_stem("Alice_3").unwrap().as_str(), "Alice");
        assert_eq!(Identity::from_stem("Alice").unwrap().as_str(), "Alice");
        assert_eq!(Identity::from_stem("Juan_Perez_12").unwrap().as_str(), "Juan_Perez");
    }

    #[test]
    fn test_identity_keeps_non_numeric_suffix() {
        assert_eq!(Identity::from_stem("Juan_Perez").unwrap().as_str(), "Juan_Perez");
        assert_eq!(Identity::from_stem("Alice_").unwrap().as_str(), "Alice_");
        assert_eq!(Identity::from_stem("Alice_3b").unwrap().as_str(), "Alice_3b");
    }

    #[test]
    fn test_identity_never_empty() {
        assert_eq!(Identity::from_stem("_3").unwrap().as_str(), "_3");
        assert!(Identity::from_stem("").is_none());
        assert!(Identity::new("   ").is_none());
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None };
        let b = BoundingBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }
}
