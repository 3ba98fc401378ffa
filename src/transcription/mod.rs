mod deepgram;
mod whisper;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use deepgram::DeepgramTranscriber;
pub use whisper::WhisperTranscriber;

use crate::error::ServiceError;
use crate::settings::{TranscriptionSettings, TrimSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Provider-neutral transcript with sentence and word timings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub sentences: Vec<Sentence>,
    pub words: Vec<Word>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.sentences.is_empty()
    }

    /// Words overlapping `[start, end]`, in order.
    pub fn words_between(&self, start: f64, end: f64) -> impl Iterator<Item = &Word> {
        self.words
            .iter()
            .filter(move |w| w.start < end && start < w.end)
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transcribe a media file. An unreadable source or an empty result is an error.
    async fn transcribe(&self, media_path: &Path) -> Result<Transcript, ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionProvider {
    Deepgram,
    Whisper,
}

impl TranscriptionProvider {
    pub fn from_name(s: &str) -> Result<Self, ServiceError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepgram" => Ok(TranscriptionProvider::Deepgram),
            "whisper" | "openai" => Ok(TranscriptionProvider::Whisper),
            other => Err(ServiceError::UnknownProvider(other.to_string())),
        }
    }

    pub fn api_key_name(&self) -> &'static str {
        match self {
            TranscriptionProvider::Deepgram => "DEEPGRAM_API_KEY",
            TranscriptionProvider::Whisper => "OPENAI_API_KEY",
        }
    }
}

/// Build the configured transcriber.
pub fn build_transcriber(
    settings: &TranscriptionSettings,
    trim: &TrimSettings,
) -> Result<Arc<dyn Transcriber>, ServiceError> {
    let provider = TranscriptionProvider::from_name(&settings.provider)?;
    if settings.api_key.trim().is_empty() {
        return Err(ServiceError::MissingApiKey(provider.api_key_name()));
    }
    Ok(match provider {
        TranscriptionProvider::Deepgram => Arc::new(DeepgramTranscriber::new(settings)?),
        TranscriptionProvider::Whisper => Arc::new(WhisperTranscriber::new(settings, trim)?),
    })
}

/// Group words into sentences, splitting on terminal punctuation or a pause
/// longer than 0.4s.
pub fn segment_into_sentences(words: &[Word]) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut current: Vec<&Word> = Vec::new();

    for (idx, word) in words.iter().enumerate() {
        current.push(word);

        let ends_with_punctuation = word
            .word
            .trim_end()
            .ends_with(['.', '!', '?', ',']);
        let has_pause = words
            .get(idx + 1)
            .map(|next| next.start - word.end > 0.4)
            .unwrap_or(false);

        if ends_with_punctuation || has_pause {
            sentences.extend(flush_sentence(&mut current));
        }
    }
    sentences.extend(flush_sentence(&mut current));
    sentences
}

fn flush_sentence(words: &mut Vec<&Word>) -> Option<Sentence> {
    let (first, last) = (words.first()?, words.last()?);
    let sentence = Sentence {
        text: words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        start: first.start,
        end: last.end,
    };
    words.clear();
    Some(sentence)
}
