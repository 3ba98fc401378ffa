use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{segment_into_sentences, Sentence, Transcriber, Transcript, Word};
use crate::error::ServiceError;
use crate::settings::TranscriptionSettings;

const PROVIDER: &str = "deepgram";
const DEFAULT_MODEL: &str = "nova-3";
const LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";

// Deepgram pre-recorded API response structures
#[derive(Debug, Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    words: Vec<DeepgramWord>,
    #[serde(default)]
    paragraphs: Option<Paragraphs>,
}

#[derive(Debug, Deserialize)]
struct DeepgramWord {
    word: String,
    #[serde(default)]
    punctuated_word: Option<String>,
    start: f64,
    end: f64,
}

#[derive(Debug, Deserialize)]
struct Paragraphs {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    sentences: Vec<DeepgramSentence>,
}

#[derive(Debug, Deserialize)]
struct DeepgramSentence {
    text: String,
    start: f64,
    end: f64,
}

pub struct DeepgramTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
}

impl DeepgramTranscriber {
    pub fn new(settings: &TranscriptionSettings) -> Result<Self, ServiceError> {
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
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn transcribe(&self, media_path: &Path) -> Result<Transcript, ServiceError> {
        let bytes = tokio::fs::read(media_path).await?;
        info!(path = %media_path.display(), size_mb = bytes.len() as f64 / (1024.0 * 1024.0), "Uploading media to Deepgram");

        let mut query = vec![
            ("model", self.model.clone()),
            ("smart_format", "true".to_string()),
            ("paragraphs", "true".to_string()),
        ];
        if !self.language.trim().is_empty() {
            query.push(("language", self.language.clone()));
        }

        let response = self
            .client
            .post(LISTEN_URL)
            .query(&query)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", content_type(media_path))
            .body(bytes)
            .send()
            .await
            .map_err(|e| ServiceError::http(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(ServiceError::from_response(PROVIDER, response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::http(PROVIDER, e))?;
        let transcript = parse_listen_response(&body)?;
        debug!(
            sentences = transcript.sentences.len(),
            words = transcript.words.len(),
            "Deepgram transcription parsed"
        );
        Ok(transcript)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

fn parse_listen_response(body: &str) -> Result<Transcript, ServiceError> {
    let response: ListenResponse =
        serde_json::from_str(body).map_err(|e| ServiceError::invalid_response(PROVIDER, e.to_string()))?;

    let alternative = response
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|c| c.alternatives.into_iter().next())
        .ok_or_else(|| ServiceError::invalid_response(PROVIDER, "no channel alternatives"))?;

    let words: Vec<Word> = alternative
        .words
        .into_iter()
        .map(|w| Word {
            word: w.punctuated_word.unwrap_or(w.word).trim().to_string(),
            start: w.start,
            end: w.end,
        })
        .filter(|w| !w.word.is_empty())
        .collect();

    let mut sentences: Vec<Sentence> = alternative
        .paragraphs
        .map(|p| {
            p.paragraphs
                .into_iter()
                .flat_map(|para| para.sentences)
                .map(|s| Sentence {
                    text: s.text,
                    start: s.start,
                    end: s.end,
                })
                .collect()
        })
        .unwrap_or_default();

    if sentences.is_empty() {
        sentences = segment_into_sentences(&words);
    }
    if words.is_empty() {
        return Err(ServiceError::Empty { provider: PROVIDER });
    }

    Ok(Transcript { sentences, words })
}
