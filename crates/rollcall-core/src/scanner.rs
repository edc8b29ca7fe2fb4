//! Video scanner: walks a video's frames under a sampling policy, runs face
//! extraction and matching on sampled frames, and accumulates the identities
//! seen.
//!
//! The scan is a small state machine:
//!
//! ```text
//! Reading ──not sampled──▶ SkipEvaluation ──▶ Reading
//!    │
//!    └──sampled──▶ FrameProcessing ──▶ Reading
//!
//! Reading ──end of stream──▶ EndOfStream
//! ```
//!
//! The scanner takes ownership of the video source, so the decoder (and any
//! scratch copy it holds) is released on every exit path.

use crate::extractor::FaceExtractor;
use crate::matcher::{cosine_equivalent, MatchOutcome, Matcher};
use crate::sampling::FrameSampler;
use crate::store::EncodingStore;
use crate::types::{AttendanceSet, DetectionEvent};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("cannot open video {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("video failure: {0}")]
    Io(#[from] VideoError),
    #[error("scan cancelled after {frames_read} frames")]
    Cancelled { frames_read: u64 },
}

/// Stream metadata reported by the container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VideoInfo {
    pub fps: Option<f64>,
    pub total_frames: Option<u64>,
    pub width: u32,
    pub height: u32,
}

/// A finite, forward-only sequence of decoded frames.
pub trait VideoSource {
    fn info(&self) -> VideoInfo;

    /// Decode the next frame as 8-bit RGB. `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError>;

    /// Read past the next frame without producing an image.
    /// Returns `false` at end of stream.
    fn skip_frame(&mut self) -> Result<bool, VideoError> {
        Ok(self.next_frame()?.is_some())
    }
}

/// Shared cancellation request, checked before every sampled frame.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coarse scan progress for the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanProgress {
    pub frames_read: u64,
    pub total_frames: Option<u64>,
    pub sampled: u64,
    pub detected: usize,
}

impl ScanProgress {
    /// Fraction of the video read, when the frame count is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_frames
            .filter(|&t| t > 0)
            .map(|t| (self.frames_read as f64 / t as f64).min(1.0))
    }
}

/// Result of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub attendance: AttendanceSet,
    /// Frame count reported by the container (may differ from `frames_read`).
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    pub frames_read: u64,
    pub frames_sampled: u64,
    /// Number of detection events (repeat sightings included).
    pub detections: usize,
    /// Sampled frames skipped because extraction failed.
    pub failed_frames: u64,
}

enum ScanState {
    Reading,
    SkipEvaluation,
    FrameProcessing { index: u64, frame: RgbImage },
    EndOfStream,
}

/// Runs scans with one extractor and matcher.
pub struct VideoScanner<E> {
    extractor: E,
    matcher: Box<dyn Matcher>,
    progress_every: u64,
}

impl<E: FaceExtractor> VideoScanner<E> {
    pub fn new(extractor: E, matcher: Box<dyn Matcher>) -> Self {
        Self {
            extractor,
            matcher,
            progress_every: 10,
        }
    }

    /// Report progress every `frames` frames read (and once at the end).
    pub fn with_progress_every(mut self, frames: u64) -> Self {
        self.progress_every = frames.max(1);
        self
    }

    pub fn into_extractor(self) -> E {
        self.extractor
    }

    /// Scan `video` against `store`.
    ///
    /// Fails with [`ScanError::Io`] if the decoder fails and with
    /// [`ScanError::Cancelled`] if `cancel` is set; neither returns a
    /// partial attendance set. `video` is dropped before returning.
    pub fn scan<V, P>(
        &mut self,
        mut video: V,
        store: &EncodingStore,
        sampler: &dyn FrameSampler,
        cancel: &CancelFlag,
        mut on_progress: P,
    ) -> Result<ScanReport, ScanError>
    where
        V: VideoSource,
        P: FnMut(ScanProgress),
    {
        let info = video.info();
        let fps = sampler.frame_rate();
        tracing::info!(
            fps = ?info.fps,
            total_frames = ?info.total_frames,
            width = info.width,
            height = info.height,
            interval = sampler.interval(),
            sampling_fps = fps,
            records = store.len(),
            tolerance = self.matcher.tolerance(),
            min_cosine = cosine_equivalent(self.matcher.tolerance()),
            "scan started"
        );

        let mut attendance = AttendanceSet::new();
        let mut progress = ScanProgress {
            total_frames: info.total_frames,
            ..ScanProgress::default()
        };
        let mut detections = 0usize;
        let mut failed_frames = 0u64;
        let mut state = ScanState::Reading;

        loop {
            state = match state {
                ScanState::Reading => {
                    let index = progress.frames_read + 1;
                    if sampler.should_sample(index) {
                        if cancel.is_cancelled() {
                            tracing::info!(frames_read = progress.frames_read, "scan cancelled");
                            return Err(ScanError::Cancelled {
                                frames_read: progress.frames_read,
                            });
                        }
                        match video.next_frame()? {
                            Some(frame) => ScanState::FrameProcessing { index, frame },
                            None => ScanState::EndOfStream,
                        }
                    } else if video.skip_frame()? {
                        ScanState::SkipEvaluation
                    } else {
                        ScanState::EndOfStream
                    }
                }
                ScanState::SkipEvaluation => {
                    progress.frames_read += 1;
                    self.tick(&progress, &mut on_progress);
                    ScanState::Reading
                }
                ScanState::FrameProcessing { index, frame } => {
                    progress.frames_read = index;
                    progress.sampled += 1;
                    match self.process_frame(&frame, index, fps, store) {
                        Ok(events) => {
                            detections += events.len();
                            attendance.extend(events.into_iter().map(|e| e.identity));
                            progress.detected = attendance.len();
                        }
                        Err(e) => {
                            failed_frames += 1;
                            tracing::warn!(frame = index, error = %e, "face extraction failed, skipping frame");
                        }
                    }
                    self.tick(&progress, &mut on_progress);
                    ScanState::Reading
                }
                ScanState::EndOfStream => break,
            };
        }

        on_progress(progress);
        drop(video);

        tracing::info!(
            frames_read = progress.frames_read,
            sampled = progress.sampled,
            detections,
            present = attendance.len(),
            failed_frames,
            "scan finished"
        );

        Ok(ScanReport {
            attendance,
            total_frames: info.total_frames,
            fps: info.fps,
            frames_read: progress.frames_read,
            frames_sampled: progress.sampled,
            detections,
            failed_frames,
        })
    }

    fn tick<P: FnMut(ScanProgress)>(&self, progress: &ScanProgress, on_progress: &mut P) {
        if progress.frames_read % self.progress_every == 0 {
            on_progress(*progress);
        }
    }

    /// Match every face in one sampled frame.
    fn process_frame(
        &mut self,
        frame: &RgbImage,
        index: u64,
        fps: f64,
        store: &EncodingStore,
    ) -> Result<Vec<DetectionEvent>, crate::extractor::ExtractorError> {
        let embeddings = self.extractor.extract_all(frame)?;
        let timestamp = Duration::from_secs_f64((index - 1) as f64 / fps);

        let events: Vec<DetectionEvent> = embeddings
            .iter()
            .filter_map(|embedding| match self.matcher.find(embedding, store) {
                MatchOutcome::Match { identity, distance, .. } => Some(DetectionEvent {
                    identity,
                    frame_index: index,
                    timestamp,
                    distance,
                }),
                MatchOutcome::NoMatch => None,
            })
            .collect();

        for event in &events {
            tracing::debug!(
                identity = %event.identity,
                frame = event.frame_index,
                at = ?event.timestamp,
                distance = event.distance,
                "face matched"
            );
        }
        if embeddings.len() > events.len() {
            tracing::debug!(frame = index, unknown = embeddings.len() - events.len(), "unmatched faces");
        }

        Ok(events)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matcher::FirstHitMatcher;
    use crate::sampling::FixedInterval;
    use crate::testing::{face_image, StubExtractor, CORRUPT};
    use crate::types::{EncodingRecord, Identity, Embedding};
    use std::sync::Mutex;

    /// In-memory video whose frame contents come from a closure.
    pub(crate) struct FakeVideo {
        pub info: VideoInfo,
        pub faces: Box<dyn Fn(u64) -> Vec<u8> + Send>,
        pub fail_at: Option<u64>,
        pub on_decode: Option<Box<dyn Fn(u64) + Send>>,
        pub decoded: Arc<Mutex<Vec<u64>>>,
        pub released: Arc<AtomicBool>,
        position: u64,
    }

    impl FakeVideo {
        pub(crate) fn new(frames: u64, fps: f64, faces: impl Fn(u64) -> Vec<u8> + Send + 'static) -> Self {
            Self {
                info: VideoInfo {
                    fps: Some(fps),
                    total_frames: Some(frames),
                    width: 4,
                    height: 2,
                },
                faces: Box::new(faces),
                fail_at: None,
                on_decode: None,
                decoded: Arc::default(),
                released: Arc::default(),
                position: 0,
            }
        }

        fn advance(&mut self) -> Result<Option<u64>, VideoError> {
            if self.position >= self.info.total_frames.unwrap_or(0) {
                return Ok(None);
            }
            self.position += 1;
            if self.fail_at == Some(self.position) {
                return Err(VideoError::Decode("corrupt packet".into()));
            }
            Ok(Some(self.position))
        }
    }

    impl VideoSource for FakeVideo {
        fn info(&self) -> VideoInfo {
            self.info
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
            let Some(index) = self.advance()? else {
                return Ok(None);
            };
            self.decoded.lock().unwrap().push(index);
            if let Some(hook) = &self.on_decode {
                hook(index);
            }
            Ok(Some(face_image(&(self.faces)(index))))
        }

        fn skip_frame(&mut self) -> Result<bool, VideoError> {
            Ok(self.advance()?.is_some())
        }
    }

    impl Drop for FakeVideo {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn alice_store() -> EncodingStore {
        EncodingStore::from_records(vec![
            EncodingRecord {
                identity: Identity::new("Alice").unwrap(),
                embedding: Embedding::new(vec![1.0, 0.0]),
                source: "Alice_1.jpg".into(),
            },
            EncodingRecord {
                identity: Identity::new("Bob").unwrap(),
                embedding: Embedding::new(vec![5.0, 0.0]),
                source: "Bob_1.jpg".into(),
            },
        ])
    }

    fn scanner(extractor: &mut StubExtractor) -> VideoScanner<&mut StubExtractor> {
        VideoScanner::new(extractor, Box::new(FirstHitMatcher::default()))
    }

    #[test]
    fn test_timestamps_use_the_sampling_frame_rate() {
        let mut stub = StubExtractor::default();
        let mut scanner = scanner(&mut stub);
        let store = alice_store();

        // A 0.5 fps report falls back to 30 fps for sampling; timestamps follow.
        let sampler = FixedInterval::for_frame_rate(Some(0.5), 30, 30);
        let events = scanner
            .process_frame(&face_image(&[10]), 31, sampler.frame_rate(), &store)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].frame_index, 31);
        assert_eq!(events[0].timestamp, Duration::from_secs(1));
    }

    #[test]
    fn test_only_sampled_frames_reach_extractor() {
        let video = FakeVideo::new(100, 30.0, |_| vec![10]);
        let decoded = video.decoded.clone();
        let mut stub = StubExtractor::default();
        let sampler = FixedInterval::for_frame_rate(video.info.fps, 30, 30);

        let report = scanner(&mut stub)
            .scan(video, &alice_store(), &sampler, &CancelFlag::new(), |_| {})
            .unwrap();

        assert_eq!(*decoded.lock().unwrap(), vec![30, 60, 90]);
        assert_eq!(stub.detect_calls, 3);
        assert_eq!(report.frames_read, 100);
        assert_eq!(report.frames_sampled, 3);
    }

    #[test]
    fn test_repeat_sightings_count_once() {
        let video = FakeVideo::new(9000, 30.0, |i| if i == 30 || i == 9000 { vec![10] } else { vec![] });
        let mut stub = StubExtractor::default();
        let sampler = FixedInterval::for_frame_rate(Some(30.0), 30, 30);

        let report = scanner(&mut stub)
            .scan(video, &alice_store(), &sampler, &CancelFlag::new(), |_| {})
            .unwrap();

        assert_eq!(report.attendance.len(), 1);
        assert!(report.attendance.contains(&Identity::new("Alice").unwrap()));
        assert_eq!(report.detections, 2);
    }

    #[test]
    fn test_every_face_in_a_frame_is_matched() {
        // Alice, an unknown face, and Bob in the same frame.
        let video = FakeVideo::new(30, 30.0, |_| vec![10, 200, 50]);
        let mut stub = StubExtractor::default();

        let report = scanner(&mut stub)
            .scan(video, &alice_store(), &FixedInterval::default(), &CancelFlag::new(), |_| {})
            .unwrap();

        let names: Vec<_> = report.attendance.iter().map(Identity::as_str).collect();
        assert_eq!(names, ["Alice", "Bob"]);
    }

    #[test]
    fn test_cancel_stops_within_one_interval_and_releases_video() {
        let cancel = CancelFlag::new();
        let mut video = FakeVideo::new(10_000, 30.0, |_| vec![10]);
        let trigger = cancel.clone();
        video.on_decode = Some(Box::new(move |i| {
            if i == 60 {
                trigger.cancel();
            }
        }));
        let decoded = video.decoded.clone();
        let released = video.released.clone();
        let mut stub = StubExtractor::default();

        let err = scanner(&mut stub)
            .scan(video, &alice_store(), &FixedInterval::default(), &cancel, |_| {})
            .unwrap_err();

        assert!(matches!(err, ScanError::Cancelled { frames_read: 89 }));
        assert_eq!(*decoded.lock().unwrap(), vec![30, 60]);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_decoder_failure_aborts_and_releases_video() {
        let mut video = FakeVideo::new(300, 30.0, |_| vec![10]);
        video.fail_at = Some(45);
        let released = video.released.clone();
        let mut stub = StubExtractor::default();

        let err = scanner(&mut stub)
            .scan(video, &alice_store(), &FixedInterval::default(), &CancelFlag::new(), |_| {})
            .unwrap_err();

        assert!(matches!(err, ScanError::Io(VideoError::Decode(_))));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_extraction_failure_skips_frame_only() {
        let video = FakeVideo::new(90, 30.0, |i| if i == 30 { vec![CORRUPT] } else { vec![10] });
        let mut stub = StubExtractor::default();

        let report = scanner(&mut stub)
            .scan(video, &alice_store(), &FixedInterval::default(), &CancelFlag::new(), |_| {})
            .unwrap();

        assert_eq!(report.failed_frames, 1);
        assert_eq!(report.attendance.len(), 1);
    }

    #[test]
    fn test_unknown_faces_yield_empty_attendance() {
        let video = FakeVideo::new(60, 30.0, |_| vec![200]);
        let mut stub = StubExtractor::default();

        let report = scanner(&mut stub)
            .scan(video, &alice_store(), &FixedInterval::default(), &CancelFlag::new(), |_| {})
            .unwrap();

        assert!(report.attendance.is_empty());
        assert_eq!(report.detections, 0);
    }

    #[test]
    fn test_progress_reported_periodically_and_at_end() {
        let video = FakeVideo::new(35, 30.0, |_| vec![]);
        let mut stub = StubExtractor::default();
        let mut seen = Vec::new();

        let report = VideoScanner::new(&mut stub, Box::new(FirstHitMatcher::default()))
            .with_progress_every(10)
            .scan(video, &alice_store(), &FixedInterval::default(), &CancelFlag::new(), |p| {
                seen.push(p.frames_read)
            })
            .unwrap();

        assert_eq!(seen, vec![10, 20, 30, 35]);
        assert_eq!(report.total_frames, Some(35));
    }

    #[test]
    fn test_progress_fraction() {
        let p = ScanProgress { frames_read: 50, total_frames: Some(200), sampled: 1, detected: 0 };
        assert_eq!(p.fraction(), Some(0.25));
        assert_eq!(ScanProgress::default().fraction(), None);
    }
}
