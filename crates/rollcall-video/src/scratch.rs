//! Scratch copy of an uploaded video.
//!
//! The decoder reads from a file, so uploads arriving as a byte stream are
//! copied to a temporary file first. The file is deleted when the
//! [`ScratchVideo`] is dropped, whatever way the scan ends.

use std::io::{self, Read};
use std::path::Path;
use tempfile::TempPath;

/// A temporary on-disk copy of a video, removed on drop.
#[derive(Debug)]
pub struct ScratchVideo {
    path: TempPath,
    bytes: u64,
}

impl ScratchVideo {
    /// Copy `reader` into a new temporary file. `extension` (e.g. `"mp4"`)
    /// helps the demuxer guess the container.
    pub fn from_reader<R: Read>(mut reader: R, extension: Option<&str>) -> io::Result<Self> {
        let suffix = extension.map(|e| format!(".{e}")).unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("rollcall-video-")
            .suffix(&suffix)
            .tempfile()?;
        let bytes = io::copy(&mut reader, &mut file)?;
        file.as_file().sync_all()?;
        let path = file.into_temp_path();
        tracing::debug!(path = %path.display(), bytes, "video copied to scratch file");
        Ok(Self { path, bytes })
    }

    /// Copy an existing file.
    pub fn copy_of(source: &Path) -> io::Result<Self> {
        let extension = source.extension().and_then(|e| e.to_str());
        Self::from_reader(std::fs::File::open(source)?, extension)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}
