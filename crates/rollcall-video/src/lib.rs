//! rollcall-video — Video input for attendance scans.
//!
//! Probes stream metadata with `ffprobe` and decodes frames to RGB
//! through an `ffmpeg` rawvideo pipe. Requires both binaries on `PATH`.

pub mod decoder;
pub mod frame;
pub mod probe;
pub mod scratch;

pub use decoder::FfmpegVideo;
pub use frame::FrameError;
pub use probe::probe;
pub use scratch::ScratchVideo;
