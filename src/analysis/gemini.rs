use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::prompt::{sentence_prompt, word_prompt};
use super::{AnalysisLevel, Analyzer};
use crate::error::ServiceError;
use crate::settings::AnalysisSettings;

const PROVIDER: &str = "gemini";
const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn from_settings(settings: &AnalysisSettings) -> Result<Self, ServiceError> {
        let api_key = settings.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(ServiceError::MissingApiKey("GEMINI_API_KEY"));
        }

        let model = if settings.model.trim().is_empty() {
            DEFAULT_GEMINI_MODEL.to_string()
        } else {
            settings.model.trim().to_string()
        };

        let endpoint = if settings.endpoint.trim().is_empty() {
            DEFAULT_GEMINI_ENDPOINT.to_string()
        } else {
            settings.endpoint.trim().trim_end_matches('/').to_string()
        };

        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
                .build()
                .map_err(|e| ServiceError::request(PROVIDER, e))?,
            api_key,
            model,
            endpoint,
        })
    }

    fn request_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl Analyzer for GeminiClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn analyze(&self, level: AnalysisLevel, transcript: &str) -> Result<String, ServiceError> {
        let prompt = match level {
            AnalysisLevel::Sentence => sentence_prompt(transcript),
            AnalysisLevel::Word => word_prompt(transcript),
        };

        let body = GeminiGenerateContentRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: 0.0,
            },
        };

        let response = self
            .http
            .post(self.request_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::http(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(ServiceError::from_response(PROVIDER, response).await);
        }

        let payload: GeminiGenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::invalid_response(PROVIDER, e.to_string()))?;

        let text = first_text(&payload).ok_or(ServiceError::Empty { provider: PROVIDER })?;
        debug!(%level, chars = text.len(), "Gemini analysis received");
        Ok(text)
    }
}

fn first_text(payload: &GeminiGenerateContentResponse) -> Option<String> {
    payload
        .candidates
        .iter()
        .flat_map(|c| c.content.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateContentRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiGenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContentResponse,
}

#[derive(Debug, Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Debug, Deserialize)]
struct GeminiPartResponse {
    text: Option<String>,
}
