//! Application settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub transcription: TranscriptionSettings,

    #[serde(default)]
    pub analysis: AnalysisSettings,

    #[serde(default)]
    pub trim: TrimSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Where job records and their artifacts live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    /// Transcription provider (deepgram, whisper)
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(default)]
    pub api_key: String,

    /// Provider model; empty uses the provider default
    #[serde(default)]
    pub model: String,

    /// Spoken language hint (empty = auto-detect)
    #[serde(default = "default_language")]
    pub language: String,

    /// Upper bound on a single transcription request
    #[serde(default = "default_transcription_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Analysis provider (gemini)
    #[serde(default = "default_analysis_provider")]
    pub provider: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_analysis_model")]
    pub model: String,

    /// API endpoint (empty = provider default)
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,

    /// Subtracted from every analysed start time
    #[serde(default = "default_start_offset")]
    pub start_offset_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimSettings {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Segments shorter than this are always re-encoded precisely
    #[serde(default = "default_short_segment_secs")]
    pub short_segment_secs: f64,

    /// How far before a segment start the coarse keyframe seek may land
    #[serde(default = "default_coarse_seek_secs")]
    pub coarse_seek_secs: f64,

    #[serde(default = "default_segment_preset")]
    pub segment_preset: String,

    #[serde(default = "default_segment_crf")]
    pub segment_crf: u8,

    /// x264 preset for the single-pass filter graph fallback
    #[serde(default = "default_fallback_preset")]
    pub fallback_preset: String,

    /// Parallel segment extraction workers (unset = available parallelism)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
}

// Default value functions

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("autotrim").join("jobs"))
        .unwrap_or_else(|| PathBuf::from("./autotrim-jobs"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transcription_provider() -> String {
    "deepgram".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_transcription_timeout() -> u64 {
    300
}

fn default_analysis_provider() -> String {
    "gemini".to_string()
}

fn default_analysis_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_analysis_timeout() -> u64 {
    120
}

fn default_start_offset() -> f64 {
    0.09
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_short_segment_secs() -> f64 {
    2.0
}

fn default_coarse_seek_secs() -> f64 {
    1.0
}

fn default_segment_preset() -> String {
    "ultrafast".to_string()
}

fn default_segment_crf() -> u8 {
    23
}

fn default_fallback_preset() -> String {
    "veryfast".to_string()
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: String::new(),
            model: String::new(),
            language: default_language(),
            timeout_secs: default_transcription_timeout(),
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            provider: default_analysis_provider(),
            api_key: String::new(),
            model: default_analysis_model(),
            endpoint: String::new(),
            timeout_secs: default_analysis_timeout(),
            start_offset_secs: default_start_offset(),
        }
    }
}

impl Default for TrimSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            short_segment_secs: default_short_segment_secs(),
            coarse_seek_secs: default_coarse_seek_secs(),
            segment_preset: default_segment_preset(),
            segment_crf: default_segment_crf(),
            fallback_preset: default_fallback_preset(),
            max_workers: None,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file, if present
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("No config file found, using defaults");
            let mut settings = Self::default();
            settings.apply_env_overrides();
            return Ok(settings);
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Fill empty API keys from the environment.
    fn apply_env_overrides(&mut self) {
        let transcription_var = match self.transcription.provider.as_str() {
            "whisper" => "OPENAI_API_KEY",
            _ => "DEEPGRAM_API_KEY",
        };
        if self.transcription.api_key.trim().is_empty() {
            if let Some(key) = env_key(transcription_var) {
                self.transcription.api_key = key;
            }
        }
        if self.analysis.api_key.trim().is_empty() {
            if let Some(key) = env_key("GEMINI_API_KEY") {
                self.analysis.api_key = key;
            }
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("autotrim").join("config.toml"))
    }

    /// Write default configuration to a file
    pub fn write_default(path: &Path) -> Result<()> {
        let settings = Self::default();
        let content = toml::to_string_pretty(&settings)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Read an API key from the environment, tolerating quoted values.
fn env_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
}
