//! Network oracle backed by an Ollama-compatible `/api/generate` endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::OracleRequest;
use crate::extraction::{ExtractionError, ExtractionResult};
use crate::oracle::ExtractionOracle;
use crate::prompts::{make_extraction_prompt, SYSTEM_PROMPT};

/// Connection settings for [`HttpOracle`].
#[derive(Debug, Clone)]
pub struct HttpOracleConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "medgemma".into(),
            timeout_secs: 60,
        }
    }
}

/// HTTP client for a hosted extraction model.
pub struct HttpOracle {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl HttpOracle {
    pub fn new(config: HttpOracleConfig) -> ExtractionResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::Unavailable(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            client,
            timeout,
        })
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl ExtractionOracle for HttpOracle {
    fn extract_changes(&self, request: &OracleRequest) -> ExtractionResult<String> {
        let url = format!("{}/api/generate", self.base_url);
        let prompt = make_extraction_prompt(request)?;
        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system: SYSTEM_PROMPT,
            stream: false,
            format: "json",
        };

        debug!(url = %url, model = %self.model, "calling extraction oracle");

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout(self.timeout)
            } else if e.is_connect() {
                ExtractionError::Unavailable(format!("cannot connect to {}", self.base_url))
            } else {
                ExtractionError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ExtractionError::Unavailable(format!(
                "oracle returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| ExtractionError::InvalidFormat(e.to_string()))?;

        Ok(parsed.response)
    }
}
