use anyhow::{Context, Result};
use rollcall_core::sampling::{FALLBACK_FPS, MIN_INTERVAL};
use rollcall_core::{MatchPolicy, DEFAULT_TOLERANCE};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file, read from the working directory when present.
const DEFAULT_CONFIG_FILE: &str = "rollcall.toml";

/// Scan configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory of labeled enrollment photos (default: ImagesAttendance).
    pub images_dir: PathBuf,
    /// Directory attendance records are written to (default: .).
    pub records_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a match (inclusive).
    pub tolerance: f32,
    pub match_policy: MatchPolicy,
    /// Frame rate assumed when the container reports none.
    pub fallback_fps: u32,
    /// Lower bound on the sampling interval, in frames.
    pub min_interval: u64,
    /// Frames between progress reports.
    pub progress_every: u64,
    /// ONNX Runtime intra-op threads per model.
    pub inference_threads: usize,
}

/// Keys accepted in the config file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    images_dir: Option<PathBuf>,
    records_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
    match_policy: Option<MatchPolicy>,
    fallback_fps: Option<u32>,
    min_interval: Option<u64>,
    progress_every: Option<u64>,
    inference_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("ImagesAttendance"),
            records_dir: PathBuf::from("."),
            model_dir: rollcall_core::default_model_dir(),
            tolerance: DEFAULT_TOLERANCE,
            match_policy: MatchPolicy::default(),
            fallback_fps: FALLBACK_FPS,
            min_interval: MIN_INTERVAL,
            progress_every: 10,
            inference_threads: 2,
        }
    }
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (or `rollcall.toml` if it exists) and
    /// the process environment.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "config file loaded");
                Some(text)
            }
            // Only the implicit default file may be absent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => None,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        Self::from_sources(file.as_deref(), &path, |key| std::env::var(key).ok())
    }

    /// Resolve from an optional TOML document and an environment lookup.
    fn from_sources(file: Option<&str>, origin: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(text) = file {
            let f: FileConfig = toml::from_str(text).with_context(|| format!("parsing {}", origin.display()))?;
            set(&mut config.images_dir, f.images_dir);
            set(&mut config.records_dir, f.records_dir);
            set(&mut config.model_dir, f.model_dir);
            set(&mut config.tolerance, f.tolerance);
            set(&mut config.match_policy, f.match_policy);
            set(&mut config.fallback_fps, f.fallback_fps);
            set(&mut config.min_interval, f.min_interval);
            set(&mut config.progress_every, f.progress_every);
            set(&mut config.inference_threads, f.inference_threads);
        }

        set(&mut config.images_dir, env("ROLLCALL_IMAGES_DIR").map(PathBuf::from));
        set(&mut config.records_dir, env("ROLLCALL_RECORDS_DIR").map(PathBuf::from));
        set(&mut config.model_dir, env("ROLLCALL_MODEL_DIR").map(PathBuf::from));
        set(&mut config.tolerance, env_parse(&env, "ROLLCALL_TOLERANCE"));
        set(&mut config.match_policy, env_parse(&env, "ROLLCALL_MATCH_POLICY"));
        set(&mut config.fallback_fps, env_parse(&env, "ROLLCALL_FALLBACK_FPS"));
        set(&mut config.min_interval, env_parse(&env, "ROLLCALL_MIN_INTERVAL"));
        set(&mut config.progress_every, env_parse(&env, "ROLLCALL_PROGRESS_EVERY"));
        set(&mut config.inference_threads, env_parse(&env, "ROLLCALL_INFERENCE_THREADS"));

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            anyhow::bail!("tolerance must be a non-negative number, got {}", self.tolerance);
        }
        if self.min_interval == 0 {
            anyhow::bail!("min_interval must be at least 1");
        }
        if self.inference_threads == 0 {
            anyhow::bail!("inference_threads must be at least 1");
        }
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Parse an environment value; unparsable values are ignored with a warning.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
