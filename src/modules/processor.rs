//! Media transformations behind a capability interface.
//!
//! The transfer protocol only knows [`MediaProcessor`] and [`DurationProbe`].
//! [`FfmpegProcessor`] is the production implementation and shells out to
//! `ffmpeg` / `ffprobe`.

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

use crate::modules::transfer::request::validate_extension;

/// Inputs above this size are compressed with the `slow` preset
const SLOW_PRESET_THRESHOLD: u64 = 300 * 1024 * 1024;
/// Inputs above this size are compressed with the `medium` preset
const MEDIUM_PRESET_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Longest stderr excerpt kept in an error
const MAX_STDERR_EXCERPT: usize = 2048;

/// Errors raised by the external tools.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("could not determine media duration: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request parameters as sent by the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestParams {
    #[serde(default)]
    pub action: i64,
    pub resolution: Option<String>,
    pub aspect_ratio: Option<String>,
    pub extension: Option<String>,
    pub startseconds: Option<f64>,
    pub endseconds: Option<f64>,
}

impl RequestParams {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The five supported actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    Compress = 1,
    ChangeResolution = 2,
    ChangeAspectRatio = 3,
    ConvertToAudio = 4,
    ExtractClip = 5,
}

impl MediaAction {
    pub fn from_code(code: i64) -> Option<MediaAction> {
        match code {
            1 => Some(MediaAction::Compress),
            2 => Some(MediaAction::ChangeResolution),
            3 => Some(MediaAction::ChangeAspectRatio),
            4 => Some(MediaAction::ConvertToAudio),
            5 => Some(MediaAction::ExtractClip),
            _ => None,
        }
    }
}

/// Target resolutions for [`MediaJob::ChangeResolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    P480,
    P720,
    P1080,
    P1440,
    K4,
}

impl Resolution {
    pub fn parse(label: &str) -> Option<Resolution> {
        match label {
            "480p" => Some(Resolution::P480),
            "720p" => Some(Resolution::P720),
            "1080p" => Some(Resolution::P1080),
            "1440p" => Some(Resolution::P1440),
            "4K" => Some(Resolution::K4),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
            Resolution::K4 => "4K",
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P480 => (854, 480),
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::P1440 => (2560, 1440),
            Resolution::K4 => (3840, 2160),
        }
    }
}

/// Display aspect ratio `W:H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub fn parse(raw: &str) -> Option<AspectRatio> {
        let (w, h) = raw.split_once(':')?;
        let width: u32 = w.trim().parse().ok()?;
        let height: u32 = h.trim().parse().ok()?;
        (width > 0 && height > 0).then_some(AspectRatio { width, height })
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

/// Why request parameters could not be turned into a job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("unsupported action: {0}")]
    UnknownAction(i64),

    #[error("invalid parameters for {action:?}: {reason}")]
    InvalidField { action: MediaAction, reason: String },
}

/// One fully validated transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaJob {
    Compress,
    ChangeResolution(Resolution),
    ChangeAspectRatio(AspectRatio),
    ConvertToAudio,
    ExtractClip {
        extension: String,
        start_seconds: f64,
        end_seconds: f64,
    },
}

impl MediaJob {
    /// Validate the action-specific fields of `params`.
    pub fn from_params(params: &RequestParams) -> Result<MediaJob, JobError> {
        let action =
            MediaAction::from_code(params.action).ok_or(JobError::UnknownAction(params.action))?;
        let invalid = |reason: String| JobError::InvalidField { action, reason };

        match action {
            MediaAction::Compress => Ok(MediaJob::Compress),
            MediaAction::ChangeResolution => {
                let label = params
                    .resolution
                    .as_deref()
                    .ok_or_else(|| invalid("missing resolution".to_string()))?;
                Resolution::parse(label)
                    .map(MediaJob::ChangeResolution)
                    .ok_or_else(|| invalid(format!("unsupported resolution {:?}", label)))
            }
            MediaAction::ChangeAspectRatio => {
                let raw = params
                    .aspect_ratio
                    .as_deref()
                    .ok_or_else(|| invalid("missing aspect_ratio".to_string()))?;
                AspectRatio::parse(raw)
                    .map(MediaJob::ChangeAspectRatio)
                    .ok_or_else(|| invalid(format!("malformed aspect ratio {:?}", raw)))
            }
            MediaAction::ConvertToAudio => Ok(MediaJob::ConvertToAudio),
            MediaAction::ExtractClip => {
                let extension = params
                    .extension
                    .as_deref()
                    .ok_or_else(|| invalid("missing extension".to_string()))?;
                let extension = validate_extension(extension).map_err(&invalid)?.to_string();
                let start_seconds = params
                    .startseconds
                    .ok_or_else(|| invalid("missing startseconds".to_string()))?;
                let end_seconds = params
                    .endseconds
                    .ok_or_else(|| invalid("missing endseconds".to_string()))?;

                if !(start_seconds >= 0.0 && end_seconds > start_seconds) {
                    return Err(invalid(format!(
                        "range {}..{} is empty or negative",
                        start_seconds, end_seconds
                    )));
                }

                Ok(MediaJob::ExtractClip {
                    extension,
                    start_seconds,
                    end_seconds,
                })
            }
        }
    }

    pub fn action(&self) -> MediaAction {
        match self {
            MediaJob::Compress => MediaAction::Compress,
            MediaJob::ChangeResolution(_) => MediaAction::ChangeResolution,
            MediaJob::ChangeAspectRatio(_) => MediaAction::ChangeAspectRatio,
            MediaJob::ConvertToAudio => MediaAction::ConvertToAudio,
            MediaJob::ExtractClip { .. } => MediaAction::ExtractClip,
        }
    }

    /// Output file name derived from the stored input's stem.
    pub fn output_file_name(&self, input_stem: &str) -> String {
        match self {
            MediaJob::Compress => format!("{}_compressed.mp4", input_stem),
            MediaJob::ChangeResolution(resolution) => {
                format!("{}_{}.mp4", input_stem, resolution.label())
            }
            MediaJob::ChangeAspectRatio(ratio) => {
                format!("{}_{}x{}.mp4", input_stem, ratio.width, ratio.height)
            }
            MediaJob::ConvertToAudio => format!("{}_audio.mp3", input_stem),
            MediaJob::ExtractClip { extension, .. } => format!("{}_clip.{}", input_stem, extension),
        }
    }
}

/// Result of a successful transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMedia {
    pub file_name: String,
    pub path: PathBuf,
}

/// Performs one transformation on a stored upload.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn process(
        &self,
        input: &Path,
        dir: &Path,
        job: &MediaJob,
    ) -> Result<ProcessedMedia, ProcessingError>;
}

/// Reports the playback duration of a media file in seconds.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration(&self, path: &Path) -> Result<f64, ProcessingError>;
}

/// ffmpeg/ffprobe-backed processor.
#[derive(Debug, Clone)]
pub struct FfmpegProcessor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegProcessor {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        FfmpegProcessor {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Arguments passed to ffmpeg for `job`, excluding the binary itself.
    pub fn ffmpeg_args(job: &MediaJob, input: &Path, output: &Path, input_size: u64) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];

        let job_args: Vec<String> = match job {
            MediaJob::Compress => {
                let preset = if input_size > SLOW_PRESET_THRESHOLD {
                    "slow"
                } else if input_size > MEDIUM_PRESET_THRESHOLD {
                    "medium"
                } else {
                    "fast"
                };
                vec!["-vcodec", "libx264", "-crf", "28", "-preset", preset, "-c:a", "copy"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
            MediaJob::ChangeResolution(resolution) => {
                let (width, height) = resolution.dimensions();
                vec![
                    "-vf".to_string(),
                    format!("scale={}:{}", width, height),
                    "-c:a".to_string(),
                    "copy".to_string(),
                    "-preset".to_string(),
                    "fast".to_string(),
                ]
            }
            MediaJob::ChangeAspectRatio(ratio) => vec![
                "-aspect".to_string(),
                ratio.to_string(),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-c:a".to_string(),
                "copy".to_string(),
                "-preset".to_string(),
                "ultrafast".to_string(),
            ],
            MediaJob::ConvertToAudio => {
                vec!["-vn", "-acodec", "mp3", "-ab", "192k", "-ar", "44100", "-ac", "2"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
            MediaJob::ExtractClip {
                start_seconds,
                end_seconds,
                ..
            } => vec![
                "-ss".to_string(),
                start_seconds.to_string(),
                "-to".to_string(),
                end_seconds.to_string(),
            ],
        };

        args.extend(job_args);
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn process(
        &self,
        input: &Path,
        dir: &Path,
        job: &MediaJob,
    ) -> Result<ProcessedMedia, ProcessingError> {
        let input_size = tokio::fs::metadata(input).await?.len();
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = job.output_file_name(&stem);
        let path = dir.join(&file_name);

        let args = Self::ffmpeg_args(job, input, &path, input_size);
        info!("Running FFmpeg: {} {}", self.ffmpeg.display(), args.join(" "));
        run_tool(&self.ffmpeg, &args).await?;

        Ok(ProcessedMedia { file_name, path })
    }
}

#[async_trait]
impl DurationProbe for FfmpegProcessor {
    async fn duration(&self, path: &Path) -> Result<f64, ProcessingError> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            path.display().to_string(),
        ];
        let stdout = run_tool(&self.ffprobe, &args).await?;
        let text = String::from_utf8_lossy(&stdout);
        let duration = parse_duration(&text)?;
        debug!("Probed duration of {}: {}s", path.display(), duration);
        Ok(duration)
    }
}

/// Parse ffprobe's `csv=p=0` duration output.
pub fn parse_duration(text: &str) -> Result<f64, ProcessingError> {
    let trimmed = text.trim();
    let duration: f64 = trimmed
        .parse()
        .map_err(|_| ProcessingError::Probe(format!("unexpected ffprobe output {:?}", trimmed)))?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(ProcessingError::Probe(format!("invalid duration {}", duration)));
    }
    Ok(duration)
}

async fn run_tool(program: &Path, args: &[String]) -> Result<Vec<u8>, ProcessingError> {
    let tool = program.display().to_string();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProcessingError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr
            .chars()
            .rev()
            .take(MAX_STDERR_EXCERPT)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        return Err(ProcessingError::ToolFailed {
            tool,
            status: output.status.to_string(),
            stderr: excerpt.trim().to_string(),
        });
    }

    Ok(output.stdout)
}
