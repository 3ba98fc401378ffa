//! Transcript analysis: the provider seam, transcript formatting, prompts and
//! parsing of the model's removal records.

mod format;
mod gemini;
mod parse;
pub mod prompt;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use format::{format_sentences, format_words};
pub use gemini::GeminiClient;
pub use parse::parse_analysis_response;

use crate::error::ServiceError;
use crate::settings::AnalysisSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLevel {
    Sentence,
    Word,
}

impl fmt::Display for AnalysisLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisLevel::Sentence => f.write_str("sentence"),
            AnalysisLevel::Word => f.write_str("word"),
        }
    }
}

/// Language-model analysis of a formatted transcript.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the model's raw response text; see [`parse_analysis_response`].
    async fn analyze(&self, level: AnalysisLevel, transcript: &str) -> Result<String, ServiceError>;
}

/// Build an analysis provider from runtime settings.
pub fn build_analyzer(settings: &AnalysisSettings) -> Result<Arc<dyn Analyzer>, ServiceError> {
    match settings.provider.trim().to_lowercase().as_str() {
        "gemini" => Ok(Arc::new(GeminiClient::from_settings(settings)?)),
        other => Err(ServiceError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_provider_returns_error() {
        let settings = AnalysisSettings {
            provider: "unknown".into(),
            ..AnalysisSettings::default()
        };
        assert!(matches!(build_analyzer(&settings), Err(ServiceError::UnknownProvider(_))));
    }
}
