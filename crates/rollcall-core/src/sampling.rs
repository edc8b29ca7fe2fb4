//! Frame sampling policies for video scans.

/// Frame rate assumed when the container does not report one.
pub const FALLBACK_FPS: u32 = 30;
/// Lower bound on the sampling interval, in frames.
pub const MIN_INTERVAL: u64 = 30;

/// Frame rate used for both sampling and timestamps: the reported rate,
/// or `fallback_fps` when it is missing, non-finite or below 1.
pub fn effective_fps(fps: Option<f64>, fallback_fps: u32) -> f64 {
    fps.filter(|f| f.is_finite() && *f >= 1.0)
        .unwrap_or_else(|| f64::from(fallback_fps.max(1)))
}

/// Decides which frames of a stream are passed to face extraction.
///
/// Frame indices are 1-based: the first frame read is frame 1.
pub trait FrameSampler: Send {
    fn should_sample(&self, frame_index: u64) -> bool;

    /// Upper bound on frames between two sampled frames.
    fn interval(&self) -> u64;

    /// Frames per second assumed when timestamping sampled frames.
    fn frame_rate(&self) -> f64;
}

/// Samples every `interval`-th frame, shifted by `offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedInterval {
    interval: u64,
    offset: u64,
    frame_rate: f64,
}

impl FixedInterval {
    pub fn new(interval: u64, offset: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            offset: offset % interval,
            frame_rate: f64::from(FALLBACK_FPS),
        }
    }

    /// Roughly one evaluated frame per second of video:
    /// `max(floor(fps), min_interval)` over [`effective_fps`].
    pub fn for_frame_rate(fps: Option<f64>, fallback_fps: u32, min_interval: u64) -> Self {
        let frame_rate = effective_fps(fps, fallback_fps);
        let whole_fps = frame_rate.floor() as u64;
        Self {
            frame_rate,
            ..Self::new(whole_fps.max(min_interval), 0)
        }
    }
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self::for_frame_rate(None, FALLBACK_FPS, MIN_INTERVAL)
    }
}

impl FrameSampler for FixedInterval {
    fn should_sample(&self, frame_index: u64) -> bool {
        frame_index > 0 && frame_index % self.interval == self.offset
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }
}
