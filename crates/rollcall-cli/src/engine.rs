use rollcall_core::extractor::ExtractorError;
use rollcall_core::store::StoreError;
use rollcall_core::{
    CancelFlag, EnrollmentWarning, FixedInterval, Identity, MatchPolicy, OnnxExtractor, Registry, ScanError, ScanProgress,
    ScanReport, VideoError, VideoScanner, VideoSource,
};
use rollcall_video::{FfmpegVideo, ScratchVideo};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("enrollment store error: {0}")]
    Store(#[from] StoreError),
    #[error("no students enrolled in {0}")]
    EmptyStore(PathBuf),
    #[error("video error: {0}")]
    Video(#[from] VideoError),
    #[error("failed to stage video: {0}")]
    Scratch(std::io::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to spawn scan thread: {0}")]
    Spawn(std::io::Error),
    #[error("scan thread exited")]
    ChannelClosed,
}

/// Where the video comes from. Either way it is staged to a scratch file
/// that is removed when the scan ends.
pub enum VideoInput {
    File(PathBuf),
    /// An upload read from stdin.
    Stdin,
}

/// What a finished scan hands back to the caller.
pub struct ScanOutcome {
    pub report: ScanReport,
    /// Everyone in the store, for the absentee list and the "X of Y" summary.
    pub known: BTreeSet<Identity>,
    pub warnings: Vec<EnrollmentWarning>,
}

/// Handle to a running scan.
pub struct ScanHandle {
    pub progress: watch::Receiver<ScanProgress>,
    pub cancel: CancelFlag,
    result: oneshot::Receiver<Result<ScanOutcome, EngineError>>,
}

impl ScanHandle {
    /// Wait for the scan thread to finish.
    pub async fn finish(self) -> Result<ScanOutcome, EngineError> {
        self.result.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn a scan on a dedicated OS thread.
///
/// Loads both ONNX models synchronously so a missing model fails before
/// anything else happens. The thread then builds the enrollment store,
/// opens the video and scans it.
pub fn spawn_scan(config: &Config, input: VideoInput) -> Result<ScanHandle, EngineError> {
    let extractor = OnnxExtractor::load(&config.model_dir, config.inference_threads)?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    let cancel = CancelFlag::new();
    let (progress_tx, progress_rx) = watch::channel(ScanProgress::default());
    let (result_tx, result_rx) = oneshot::channel();

    let job = ScanJob {
        registry: Registry::new(&config.images_dir),
        policy: config.match_policy,
        tolerance: config.tolerance,
        fallback_fps: config.fallback_fps,
        min_interval: config.min_interval,
        progress_every: config.progress_every,
    };
    let thread_cancel = cancel.clone();

    std::thread::Builder::new()
        .name("rollcall-scan".into())
        .spawn(move || {
            tracing::debug!("scan thread started");
            let result = job.run(extractor, input, &thread_cancel, &progress_tx);
            let _ = result_tx.send(result);
            tracing::debug!("scan thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(ScanHandle {
        progress: progress_rx,
        cancel,
        result: result_rx,
    })
}

struct ScanJob {
    registry: Registry,
    policy: MatchPolicy,
    tolerance: f32,
    fallback_fps: u32,
    min_interval: u64,
    progress_every: u64,
}

impl ScanJob {
    fn run(
        self,
        mut extractor: OnnxExtractor,
        input: VideoInput,
        cancel: &CancelFlag,
        progress: &watch::Sender<ScanProgress>,
    ) -> Result<ScanOutcome, EngineError> {
        let build = self.registry.build_store(&mut extractor)?;
        for warning in &build.warnings {
            tracing::warn!(%warning, "enrollment photo skipped");
        }
        if build.store.is_empty() {
            return Err(EngineError::EmptyStore(self.registry.dir().to_path_buf()));
        }
        let store = build.store;

        let scratch = match input {
            VideoInput::File(path) => ScratchVideo::copy_of(&path).map_err(|e| VideoError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            VideoInput::Stdin => ScratchVideo::from_reader(std::io::stdin().lock(), None).map_err(EngineError::Scratch)?,
        };
        tracing::info!(path = %scratch.path().display(), bytes = scratch.len(), "video staged");
        let video = FfmpegVideo::open_scratch(scratch)?;
        let sampler = FixedInterval::for_frame_rate(video.info().fps, self.fallback_fps, self.min_interval);

        let mut scanner = VideoScanner::new(extractor, self.policy.matcher(self.tolerance)).with_progress_every(self.progress_every);
        let report = scanner.scan(video, &store, &sampler, cancel, |p| {
            progress.send_replace(p);
        })?;

        Ok(ScanOutcome {
            report,
            known: store.identities(),
            warnings: build.warnings,
        })
    }
}
