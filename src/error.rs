use thiserror::Error;

use crate::ffmpeg::MediaError;

/// Failure talking to a transcription or analysis provider.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no API key configured for {0}")]
    MissingApiKey(&'static str),

    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("{provider} request failed: {message}")]
    Request {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} API error ({status}): {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid {provider} response: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} returned no usable content")]
    Empty { provider: &'static str },

    #[error("{what} timed out after {secs}s")]
    Timeout { what: &'static str, secs: u64 },

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn request(provider: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Request {
            provider,
            message: err.to_string(),
        }
    }

    /// A transport failure. The URL is dropped so credentials carried in it
    /// never reach logs or persisted job records.
    pub fn http(provider: &'static str, err: reqwest::Error) -> Self {
        Self::request(provider, err.without_url())
    }

    pub fn invalid_response(provider: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider,
            message: message.into(),
        }
    }

    /// Turn a non-success HTTP response into [`ServiceError::Api`], keeping the body.
    pub async fn from_response(provider: &'static str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::Api {
            provider,
            status,
            body,
        }
    }
}
