//! Frame decoding by piping `ffmpeg` rawvideo output.
//!
//! ffmpeg converts every frame to packed 8-bit RGB (`-pix_fmt rgb24`) and
//! writes them back to back on stdout, so each frame is exactly
//! `width * height * 3` bytes. ffmpeg applies the stream's display rotation
//! while decoding; `probe` reports the rotated size to match.

use crate::frame::{self, FrameError};
use crate::probe;
use crate::scratch::ScratchVideo;
use image::RgbImage;
use rollcall_core::{VideoError, VideoInfo, VideoSource};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// A video opened for sequential RGB decoding.
///
/// Owns the ffmpeg child process and, when opened from a scratch copy, the
/// temporary file. Dropping the decoder kills the process and deletes the
/// scratch file.
pub struct FfmpegVideo {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    info: VideoInfo,
    path: PathBuf,
    buf: Vec<u8>,
    finished: bool,
    _scratch: Option<ScratchVideo>,
}

impl FfmpegVideo {
    /// Probe and open `path` for decoding.
    pub fn open(path: &Path) -> Result<Self, VideoError> {
        let info = probe::probe(path)?;
        let mut child = Command::new("ffmpeg")
            .args(["-nostdin", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-vsync", "passthrough", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VideoError::Open {
                path: path.display().to_string(),
                reason: format!("failed to run ffmpeg (is ffmpeg installed?): {e}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| VideoError::Open {
            path: path.display().to_string(),
            reason: "ffmpeg stdout unavailable".into(),
        })?;
        // Drain stderr so a chatty decoder never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        tracing::info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = ?info.fps,
            total_frames = ?info.total_frames,
            "video opened"
        );

        Ok(Self {
            child,
            stdout: BufReader::with_capacity(1 << 20, stdout),
            stderr,
            buf: vec![0u8; frame::frame_len(info.width, info.height)],
            info,
            path: path.to_path_buf(),
            finished: false,
            _scratch: None,
        })
    }

    /// Open a scratch copy; the copy lives exactly as long as the decoder.
    pub fn open_scratch(scratch: ScratchVideo) -> Result<Self, VideoError> {
        let mut video = Self::open(scratch.path())?;
        video._scratch = Some(scratch);
        Ok(video)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one frame into the internal buffer; on end of stream, check
    /// how the decoder exited.
    fn fill(&mut self) -> Result<bool, VideoError> {
        if self.finished {
            return Ok(false);
        }
        match frame::read_frame(&mut self.stdout, &mut self.buf) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.finished = true;
                self.check_exit()?;
                Ok(false)
            }
            Err(FrameError::Io(e)) => Err(VideoError::Io(e)),
            Err(e) => {
                self.finished = true;
                let detail = self.check_exit().err().map(|e| format!(" ({e})")).unwrap_or_default();
                Err(VideoError::Decode(format!("{e}{detail}")))
            }
        }
    }

    fn check_exit(&mut self) -> Result<(), VideoError> {
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        Err(VideoError::Decode(format!("ffmpeg exited with {status}: {}", stderr.trim())))
    }
}

impl VideoSource for FfmpegVideo {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        if !self.fill()? {
            return Ok(None);
        }
        frame::to_image(self.buf.clone(), self.info.width, self.info.height)
            .map(Some)
            .map_err(|e| VideoError::Decode(e.to_string()))
    }

    fn skip_frame(&mut self) -> Result<bool, VideoError> {
        self.fill()
    }
}

impl Drop for FfmpegVideo {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        tracing::debug!(path = %self.path.display(), "video released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_is_open_error() {
        let result = FfmpegVideo::open(Path::new("/nonexistent/lecture.mp4"));
        assert!(matches!(result, Err(VideoError::Open { .. })));
    }
}
