//! Raw RGB frame reading from a decoder pipe.

use image::RgbImage;
use std::io::{ErrorKind, Read};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid frame buffer: expected {expected} bytes for {width}x{height}, got {actual}")]
    InvalidLength {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Fill `buf` with exactly one frame.
///
/// Returns `Ok(false)` on a clean end of stream (no bytes available) and
/// an error if the stream ends mid-frame.
pub fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        actual => Err(FrameError::Truncated {
            expected: buf.len(),
            actual,
        }),
    }
}

/// Bytes per `rgb24` pixel.
pub const CHANNELS: usize = 3;

/// Size in bytes of one packed `rgb24` frame.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

/// Wrap a packed `rgb24` buffer (`width * height * 3` bytes) as an image.
pub fn to_image(buf: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = frame_len(width, height);
    let actual = buf.len();
    RgbImage::from_raw(width, height, buf).ok_or(FrameError::InvalidLength {
        expected,
        actual,
        width,
        height,
    })
}
