//! rollcall-core — Attendance detection pipeline.
//!
//! Builds an encoding store from labeled enrollment photos, scans a video
//! under a sampling policy, matches detected faces against the store and
//! records who was present. Face extraction uses SCRFD for detection and
//! ArcFace for embeddings, both running via ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod recorder;
pub mod registry;
pub mod sampling;
pub mod scanner;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use extractor::{default_model_dir, FaceExtractor, OnnxExtractor};
pub use matcher::{cosine_equivalent, FirstHitMatcher, MatchOutcome, MatchPolicy, Matcher, NearestMatcher, DEFAULT_TOLERANCE};
pub use recorder::{AttendanceRecord, PersistenceError};
pub use registry::Registry;
pub use sampling::{FixedInterval, FrameSampler};
pub use scanner::{CancelFlag, ScanError, ScanProgress, ScanReport, VideoError, VideoInfo, VideoScanner, VideoSource};
pub use store::{BuildReport, EncodingStore, EnrollmentWarning};
pub use types::{AttendanceSet, BoundingBox, DetectionEvent, Embedding, EncodingRecord, Identity};
