use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cut::ExtractStrategy;
use crate::interval::KeepInterval;
use crate::settings::TrimSettings;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    NotFound(String),

    #[error("{tool} failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Failed to parse {what} from ffprobe output: {output}")]
    Probe { what: &'static str, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
            exit_code,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// The media operations the trimming engine depends on.
///
/// Calls block until the underlying tool exits; the cut orchestrator runs them
/// from a worker pool and the pipeline from a blocking task.
pub trait MediaToolchain: Send + Sync {
    /// Verify the tools are installed before any work is attempted.
    fn check_available(&self) -> MediaResult<()> {
        Ok(())
    }

    fn probe_duration(&self, path: &Path) -> MediaResult<f64>;

    /// Sorted keyframe timestamps of the first video stream; empty when unknown.
    fn probe_keyframes(&self, path: &Path) -> MediaResult<Vec<f64>>;

    /// Cut one keep interval into a standalone, uniformly encoded clip.
    fn extract_clip(
        &self,
        source: &Path,
        interval: &KeepInterval,
        strategy: &ExtractStrategy,
        output: &Path,
    ) -> MediaResult<()>;

    /// Join clips, in the given order, by stream copy.
    fn concat(&self, clips: &[PathBuf], output: &Path) -> MediaResult<()>;

    /// Cut a single interval straight from the source by stream copy.
    fn cut_single(&self, source: &Path, interval: &KeepInterval, output: &Path) -> MediaResult<()>;

    /// Trim and re-join every interval in one invocation, with no intermediate clips.
    fn trim_and_join(&self, source: &Path, keeps: &[KeepInterval], output: &Path) -> MediaResult<()>;
}

/// [`MediaToolchain`] backed by the `ffmpeg` and `ffprobe` command line tools.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
    segment_preset: String,
    segment_crf: u8,
    fallback_preset: String,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::from_settings(&TrimSettings::default())
    }
}

impl Ffmpeg {
    pub fn from_settings(settings: &TrimSettings) -> Self {
        Self {
            ffmpeg: settings.ffmpeg_path.clone(),
            ffprobe: settings.ffprobe_path.clone(),
            segment_preset: settings.segment_preset.clone(),
            segment_crf: settings.segment_crf,
            fallback_preset: settings.fallback_preset.clone(),
        }
    }

    pub fn check_ffmpeg_installed(&self) -> MediaResult<PathBuf> {
        which::which(&self.ffmpeg).map_err(|_| MediaError::NotFound(self.ffmpeg.clone()))
    }

    pub fn check_ffprobe_installed(&self) -> MediaResult<PathBuf> {
        which::which(&self.ffprobe).map_err(|_| MediaError::NotFound(self.ffprobe.clone()))
    }

    /// Extract a mono 16kHz mp3 track, small enough for upload-based transcription.
    pub fn extract_audio(&self, video_path: &Path, output_path: &Path) -> MediaResult<()> {
        let args = vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            path_arg(video_path),
            "-vn".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-b:a".to_string(),
            "64k".to_string(),
            path_arg(output_path),
        ];
        self.run_ffmpeg(&args, "audio extraction")
    }

    /// Copy `length` seconds of an audio file starting at `start`.
    pub fn split_audio(&self, audio_path: &Path, start: f64, length: f64, output_path: &Path) -> MediaResult<()> {
        let args = vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            secs(start),
            "-i".to_string(),
            path_arg(audio_path),
            "-t".to_string(),
            secs(length),
            "-c".to_string(),
            "copy".to_string(),
            path_arg(output_path),
        ];
        self.run_ffmpeg(&args, "audio split")
    }

    /// Shared encoder arguments so every intermediate clip concatenates cleanly.
    fn segment_codec_args(&self) -> Vec<String> {
        [
            "-c:v",
            "libx264",
            "-preset",
            &self.segment_preset,
            "-crf",
            &self.segment_crf.to_string(),
            "-c:a",
            "aac",
            "-avoid_negative_ts",
            "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn extract_args(
        &self,
        source: &Path,
        interval: &KeepInterval,
        strategy: &ExtractStrategy,
        output: &Path,
    ) -> Vec<String> {
        let mut args = vec!["-nostdin".to_string(), "-y".to_string()];
        match *strategy {
            ExtractStrategy::Precise => {
                args.extend([
                    "-ss".to_string(),
                    secs(interval.start),
                    "-to".to_string(),
                    secs(interval.end),
                    "-i".to_string(),
                    path_arg(source),
                ]);
            }
            ExtractStrategy::KeyframeSeek { coarse_start } => {
                args.extend([
                    "-ss".to_string(),
                    secs(coarse_start),
                    "-i".to_string(),
                    path_arg(source),
                    "-ss".to_string(),
                    secs(interval.start - coarse_start),
                    "-to".to_string(),
                    secs(interval.end - coarse_start),
                ]);
            }
            ExtractStrategy::DirectSeek => {
                args.extend([
                    "-ss".to_string(),
                    secs(interval.start),
                    "-i".to_string(),
                    path_arg(source),
                    "-to".to_string(),
                    secs(interval.duration()),
                ]);
            }
        }
        args.extend(self.segment_codec_args());
        args.push(path_arg(output));
        args
    }

    fn run_ffmpeg(&self, args: &[String], what: &str) -> MediaResult<()> {
        debug!("Running {}: {} {}", what, self.ffmpeg, args.join(" "));
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::NotFound(self.ffmpeg.clone()),
                _ => MediaError::Io(e),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("unknown error");
        Err(MediaError::tool_failed(
            "ffmpeg",
            format!("{} failed: {}", what, last_line.trim()),
            output.status.code(),
        ))
    }

    fn run_ffprobe(&self, args: &[&str], path: &Path) -> MediaResult<String> {
        let output = Command::new(&self.ffprobe)
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::NotFound(self.ffprobe.clone()),
                _ => MediaError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::tool_failed(
                "ffprobe",
                stderr.trim().to_string(),
                output.status.code(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl MediaToolchain for Ffmpeg {
    fn check_available(&self) -> MediaResult<()> {
        self.check_ffmpeg_installed()?;
        self.check_ffprobe_installed()?;
        Ok(())
    }

    fn probe_duration(&self, path: &Path) -> MediaResult<f64> {
        let stdout = self.run_ffprobe(
            &[
                "-v", "error",
                "-show_entries", "format=duration",
                "-of", "default=noprint_wrappers=1:nokey=1",
            ],
            path,
        )?;
        parse_duration(&stdout)
    }

    fn probe_keyframes(&self, path: &Path) -> MediaResult<Vec<f64>> {
        let stdout = self.run_ffprobe(
            &[
                "-v", "error",
                "-skip_frame", "nokey",
                "-select_streams", "v:0",
                "-show_entries", "frame=pts_time",
                "-of", "csv=p=0",
            ],
            path,
        )?;
        Ok(parse_keyframes(&stdout))
    }

    fn extract_clip(
        &self,
        source: &Path,
        interval: &KeepInterval,
        strategy: &ExtractStrategy,
        output: &Path,
    ) -> MediaResult<()> {
        let args = self.extract_args(source, interval, strategy, output);
        self.run_ffmpeg(&args, "segment extraction")
    }

    fn concat(&self, clips: &[PathBuf], output: &Path) -> MediaResult<()> {
        let first = clips
            .first()
            .ok_or_else(|| MediaError::internal("concat called with no clips"))?;
        let manifest = first
            .parent()
            .unwrap_or(Path::new("."))
            .join("concat_list.txt");
        std::fs::write(&manifest, concat_manifest(clips))?;

        let args = vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            path_arg(&manifest),
            "-c".to_string(),
            "copy".to_string(),
            path_arg(output),
        ];
        self.run_ffmpeg(&args, "concatenation")
    }

    fn cut_single(&self, source: &Path, interval: &KeepInterval, output: &Path) -> MediaResult<()> {
        let args = vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            secs(interval.start),
            "-to".to_string(),
            secs(interval.end),
            "-i".to_string(),
            path_arg(source),
            "-c".to_string(),
            "copy".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            path_arg(output),
        ];
        self.run_ffmpeg(&args, "single cut")
    }

    fn trim_and_join(&self, source: &Path, keeps: &[KeepInterval], output: &Path) -> MediaResult<()> {
        if keeps.is_empty() {
            return Err(MediaError::internal("trim_and_join called with no intervals"));
        }

        // Write the graph to a script next to the output to stay clear of
        // command line length limits on long keep lists.
        let filter_path = output
            .parent()
            .unwrap_or(Path::new("."))
            .join("filter.txt");
        std::fs::write(&filter_path, trim_join_filter(keeps))?;

        let args = vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            path_arg(source),
            "-filter_complex_script".to_string(),
            path_arg(&filter_path),
            "-map".to_string(),
            "[outv]".to_string(),
            "-map".to_string(),
            "[outa]".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.fallback_preset.clone(),
            "-crf".to_string(),
            self.segment_crf.to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            path_arg(output),
        ];
        self.run_ffmpeg(&args, "single-pass trim")
    }
}

fn secs(value: f64) -> String {
    format!("{:.6}", value.max(0.0))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_duration(stdout: &str) -> MediaResult<f64> {
    let trimmed = stdout.trim();
    match trimmed.parse::<f64>() {
        Ok(duration) if duration.is_finite() && duration > 0.0 => Ok(duration),
        _ => Err(MediaError::Probe {
            what: "duration",
            output: trimmed.to_string(),
        }),
    }
}

/// Parse ffprobe's one-timestamp-per-line keyframe listing. Unparseable output
/// means keyframes are unknown, not an error.
fn parse_keyframes(stdout: &str) -> Vec<f64> {
    let mut keyframes = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        // Some containers emit a trailing separator: "1.234000,"
        match line.trim_end_matches(',').parse::<f64>() {
            Ok(ts) => keyframes.push(ts),
            Err(_) => {
                warn!("Could not parse keyframe timestamp {:?}, treating keyframes as unknown", line);
                return Vec::new();
            }
        }
    }
    keyframes.sort_by(f64::total_cmp);
    keyframes
}

/// Concat demuxer manifest; single quotes in paths are escaped per ffmpeg rules.
fn concat_manifest(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

fn trim_join_filter(keeps: &[KeepInterval]) -> String {
    let mut filter = String::new();
    let mut pads = String::new();
    for (i, k) in keeps.iter().enumerate() {
        filter.push_str(&format!(
            "[0:v]trim=start={s:.6}:end={e:.6},setpts=PTS-STARTPTS[v{i}];\
             [0:a]atrim=start={s:.6}:end={e:.6},asetpts=PTS-STARTPTS[a{i}];",
            s = k.start,
            e = k.end,
            i = i
        ));
        pads.push_str(&format!("[v{i}][a{i}]"));
    }
    filter.push_str(&pads);
    filter.push_str(&format!("concat=n={}:v=1:a=1[outv][outa]", keeps.len()));
    filter
}
