use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use tracing::{info, warn};

use super::{segment_into_sentences, Transcriber, Transcript, Word};
use crate::error::ServiceError;
use crate::ffmpeg::{Ffmpeg, MediaToolchain};
use crate::settings::{TranscriptionSettings, TrimSettings};

const PROVIDER: &str = "whisper";
const DEFAULT_MODEL: &str = "whisper-1";
const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Max chunk duration in seconds (~20 min at 64kbps ≈ 9.4MB, well under 25MB)
const CHUNK_DURATION_SECS: f64 = 1200.0;
const MAX_UPLOAD_MB: f64 = 24.0;
const MAX_RETRIES: u32 = 3;

// OpenAI Whisper API response structures
#[derive(Debug, Deserialize)]
struct WhisperApiResponse {
    #[serde(default)]
    words: Vec<WhisperApiWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperApiWord {
    word: String,
    start: f64,
    end: f64,
}

/// OpenAI Whisper with word timestamps. Audio is extracted to mono mp3 first
/// and split into chunks when it exceeds the upload limit.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
    ffmpeg: Ffmpeg,
}

impl WhisperTranscriber {
    pub fn new(settings: &TranscriptionSettings, trim: &TrimSettings) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| ServiceError::request(PROVIDER, e))?;
        let model = if settings.model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            settings.model.clone()
        };
        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            model,
            language: settings.language.clone(),
            ffmpeg: Ffmpeg::from_settings(trim),
        })
    }

    async fn run_ffmpeg<F>(&self, op: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&Ffmpeg) -> Result<(), crate::ffmpeg::MediaError> + Send + 'static,
    {
        let ffmpeg = self.ffmpeg.clone();
        tokio::task::spawn_blocking(move || op(&ffmpeg))
            .await
            .map_err(|e| ServiceError::request(PROVIDER, format!("ffmpeg task failed: {}", e)))??;
        Ok(())
    }

    async fn transcribe_with_retry(&self, audio_path: &Path, time_offset: f64) -> Result<Vec<Word>, ServiceError> {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(2u64.pow(attempt)); // 2s, 4s
                warn!(attempt = attempt + 1, delay_secs = delay.as_secs(), "Retrying Whisper request");
                tokio::time::sleep(delay).await;
            }
            match self.transcribe_single_file(audio_path, time_offset).await {
                Ok(words) => return Ok(words),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Whisper request failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(ServiceError::Empty { provider: PROVIDER }))
    }

    async fn transcribe_single_file(&self, audio_path: &Path, time_offset: f64) -> Result<Vec<Word>, ServiceError> {
        let file_bytes = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let file_part = multipart::Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| ServiceError::request(PROVIDER, e))?;

        let mut form = multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");
        if !self.language.trim().is_empty() {
            form = form.text("language", self.language.clone());
        }

        let response = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::http(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(ServiceError::from_response(PROVIDER, response).await);
        }

        let api_response: WhisperApiResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::invalid_response(PROVIDER, e.to_string()))?;

        Ok(offset_words(api_response.words, time_offset))
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn transcribe(&self, media_path: &Path) -> Result<Transcript, ServiceError> {
        let scratch = tempfile::tempdir()?;
        let audio_path = scratch.path().join("audio.mp3");
        {
            let (src, dst) = (media_path.to_path_buf(), audio_path.clone());
            self.run_ffmpeg(move |f| f.extract_audio(&src, &dst)).await?;
        }

        let size_mb = tokio::fs::metadata(&audio_path).await?.len() as f64 / (1024.0 * 1024.0);
        info!(size_mb, "Extracted audio for Whisper");

        let words = if size_mb <= MAX_UPLOAD_MB {
            self.transcribe_with_retry(&audio_path, 0.0).await?
        } else {
            let probe = self.ffmpeg.clone();
            let probe_path = audio_path.clone();
            let total_duration = tokio::task::spawn_blocking(move || probe.probe_duration(&probe_path))
                .await
                .map_err(|e| ServiceError::request(PROVIDER, format!("ffprobe task failed: {}", e)))??;

            let num_chunks = (total_duration / CHUNK_DURATION_SECS).ceil() as usize;
            info!(total_duration, num_chunks, "Splitting audio for Whisper upload limit");

            let mut all_words = Vec::new();
            for i in 0..num_chunks {
                let start = i as f64 * CHUNK_DURATION_SECS;
                let chunk_path: PathBuf = scratch.path().join(format!("chunk_{}.mp3", i));
                {
                    let (src, dst) = (audio_path.clone(), chunk_path.clone());
                    self.run_ffmpeg(move |f| f.split_audio(&src, start, CHUNK_DURATION_SECS, &dst))
                        .await?;
                }
                info!(chunk = i + 1, num_chunks, offset = start, "Transcribing chunk");
                all_words.extend(self.transcribe_with_retry(&chunk_path, start).await?);
                let _ = tokio::fs::remove_file(&chunk_path).await;
            }
            all_words
        };

        if words.is_empty() {
            return Err(ServiceError::Empty { provider: PROVIDER });
        }
        info!(words = words.len(), "Whisper transcription complete");
        Ok(Transcript {
            sentences: segment_into_sentences(&words),
            words,
        })
    }
}

fn offset_words(words: Vec<WhisperApiWord>, time_offset: f64) -> Vec<Word> {
    words
        .into_iter()
        .map(|w| Word {
            word: w.word.trim().to_string(),
            start: w.start + time_offset,
            end: w.end + time_offset,
        })
        .filter(|w| !w.word.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_words_are_shifted_and_trimmed() {
        let response: WhisperApiResponse = serde_json::from_str(
            r#"{"text": "hi there", "words": [
                {"word": " hi", "start": 0.0, "end": 0.2},
                {"word": " ", "start": 0.2, "end": 0.3},
                {"word": "there", "start": 0.3, "end": 0.6}
            ]}"#,
        )
        .unwrap();
        let words = offset_words(response.words, 1200.0);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].word, "hi");
        assert!((words[1].start - 1200.3).abs() < 1e-9);
    }
}
