use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::recorder::{self, AttendanceRecord};
use rollcall_core::{OnnxExtractor, Registry, ScanError, ScanProgress};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{EngineError, VideoInput};

#[derive(Parser)]
#[command(name = "rollcall", about = "Take class attendance from a video")]
struct Cli {
    /// Directory of labeled enrollment photos
    #[arg(long, global = true)]
    images_dir: Option<PathBuf>,
    /// Directory attendance records are written to
    #[arg(long, global = true)]
    records_dir: Option<PathBuf>,
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Maximum face distance counted as a match
    #[arg(long, global = true)]
    tolerance: Option<f32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from one or more photos
    Enroll {
        /// Student name, used as the label in records
        #[arg(short, long)]
        name: String,
        /// Photos showing the student's face
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List enrolled students and their photo counts
    Students,
    /// Scan a video and record who was present
    Scan {
        /// Video file, or `-` to read it from stdin
        video: PathBuf,
        /// Print the attendance without writing a record
        #[arg(long)]
        no_save: bool,
    },
    /// List saved attendance records
    Records {
        /// Print the rows of one record
        #[arg(long)]
        show: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(dir) = cli.images_dir {
        config.images_dir = dir;
    }
    if let Some(dir) = cli.records_dir {
        config.records_dir = dir;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }
    if let Some(tolerance) = cli.tolerance {
        anyhow::ensure!(tolerance.is_finite() && tolerance >= 0.0, "tolerance must be non-negative");
        config.tolerance = tolerance;
    }

    match cli.command {
        Commands::Enroll { name, photos } => {
            tokio::task::spawn_blocking(move || enroll(&config, &name, &photos)).await??;
        }
        Commands::Students => {
            tokio::task::spawn_blocking(move || students(&config)).await??;
        }
        Commands::Scan { video, no_save } => {
            let input = if video.as_os_str() == "-" {
                VideoInput::Stdin
            } else {
                VideoInput::File(video)
            };
            scan(&config, input, no_save).await?;
        }
        Commands::Records { show: Some(file) } => show_record(&config, &file)?,
        Commands::Records { show: None } => list_records(&config)?,
    }

    Ok(())
}

fn load_extractor(config: &Config) -> Result<OnnxExtractor> {
    OnnxExtractor::load(&config.model_dir, config.inference_threads)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))
}

fn enroll(config: &Config, name: &str, photos: &[PathBuf]) -> Result<()> {
    let mut extractor = load_extractor(config)?;
    let registry = Registry::new(&config.images_dir);
    let outcome = registry.enroll(&mut extractor, name, photos)?;

    for warning in &outcome.rejected {
        println!("  rejected: {warning}");
    }
    if outcome.saved.is_empty() {
        anyhow::bail!("no photo of {} had a detectable face; nothing enrolled", outcome.identity);
    }
    println!(
        "Enrolled {} with {} photo(s) in {}",
        outcome.identity,
        outcome.saved.len(),
        registry.dir().display()
    );
    Ok(())
}

fn students(config: &Config) -> Result<()> {
    let mut extractor = load_extractor(config)?;
    let build = Registry::new(&config.images_dir).build_store(&mut extractor)?;
    for warning in &build.warnings {
        tracing::warn!(%warning, "enrollment photo skipped");
    }

    let roster = build.store.roster();
    if roster.is_empty() {
        println!("No students enrolled in {}", config.images_dir.display());
        return Ok(());
    }
    for (identity, photos) in &roster {
        println!("{identity:<30} {photos} photo(s)");
    }
    println!(
        "\n{} student(s), {} photo(s), snapshot {}",
        roster.len(),
        build.store.len(),
        build.store.fingerprint()
    );
    Ok(())
}

async fn scan(config: &Config, input: VideoInput, no_save: bool) -> Result<()> {
    let handle = engine::spawn_scan(config, input)?;
    let mut progress = handle.progress.clone();
    let cancel = handle.cancel.clone();
    let finish = handle.finish();
    tokio::pin!(finish);

    let result = loop {
        tokio::select! {
            result = &mut finish => break result,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("\ncancelling scan...");
                cancel.cancel();
            }
            Ok(()) = progress.changed() => {
                let update = *progress.borrow_and_update();
                print_progress(&update);
            }
        }
    };
    eprintln!();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(EngineError::Scan(ScanError::Cancelled { frames_read })) => {
            anyhow::bail!("scan cancelled after {frames_read} frames; no attendance recorded")
        }
        Err(e) => return Err(e.into()),
    };

    let report = &outcome.report;
    if report.failed_frames > 0 {
        println!("warning: {} sampled frame(s) could not be analysed", report.failed_frames);
    }
    println!(
        "Detected {} of {} students ({} frames read, {} analysed)",
        report.attendance.len(),
        outcome.known.len(),
        report.frames_read,
        report.frames_sampled
    );
    for identity in &report.attendance {
        println!("  present  {identity}");
    }
    for identity in recorder::absentees(&report.attendance, &outcome.known) {
        println!("  absent   {identity}");
    }

    if no_save {
        return Ok(());
    }
    let record = AttendanceRecord::new(&report.attendance, &outcome.known);
    let path = record
        .persist(&config.records_dir)
        .with_context(|| format!("attendance was taken but could not be saved to {}", config.records_dir.display()))?;
    println!("Saved {}", path.display());
    Ok(())
}

fn print_progress(progress: &ScanProgress) {
    let mut err = std::io::stderr().lock();
    let _ = match progress.fraction() {
        Some(f) => write!(
            err,
            "\rscanning {:>5.1}%  frame {}  detected {}",
            f * 100.0,
            progress.frames_read,
            progress.detected
        ),
        None => write!(err, "\rscanning frame {}  detected {}", progress.frames_read, progress.detected),
    };
    let _ = err.flush();
}

fn list_records(config: &Config) -> Result<()> {
    let records = recorder::list_records(&config.records_dir)?;
    if records.is_empty() {
        println!("No attendance records in {}", config.records_dir.display());
    }
    for path in records {
        println!("{}", path.display());
    }
    Ok(())
}

fn show_record(config: &Config, file: &Path) -> Result<()> {
    let path = if file.exists() {
        file.to_path_buf()
    } else {
        config.records_dir.join(file)
    };
    let rows = recorder::read_record(&path)?;
    println!("{:<30} {:<10} {:<8} Present", "Name", "Date", "Time");
    for row in rows {
        println!("{:<30} {:<10} {:<8} {}", row.name, row.date, row.time, row.present);
    }
    Ok(())
}
