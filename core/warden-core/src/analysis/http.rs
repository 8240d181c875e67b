use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::{Prompt, Strategy, VerdictSource};
use crate::capture::CaptureBatch;
use crate::error::{Result, WardenError};

const MAX_OUTPUT_TOKENS: u32 = 4000;

/// `generateContent` with the screenshots inlined as base64 parts.
pub struct HttpStrategy {
    api_base: String,
    model: String,
    api_key: String,
    timeout: Duration,
    client: Option<reqwest::blocking::Client>,
}

impl HttpStrategy {
    pub fn new(api_base: String, model: String, api_key: String, timeout: Duration) -> Self {
        Self {
            api_base,
            model,
            api_key,
            timeout,
            client: None,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|err| failure(format!("failed to build HTTP client: {}", err)))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| failure("HTTP client unavailable"))
    }
}

impl Strategy for HttpStrategy {
    fn source(&self) -> VerdictSource {
        VerdictSource::Api
    }

    fn available(&mut self) -> bool {
        !self.api_key.is_empty()
    }

    fn analyze(&mut self, batch: &CaptureBatch, prompt: &Prompt) -> Result<String> {
        let body = request_body(batch, prompt)?;
        let url = self.endpoint();
        let key = self.api_key.clone();
        let timeout = self.timeout;

        let resp = self
            .client()?
            .post(&url)
            .query(&[("key", key.as_str())])
            .json(&body)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    WardenError::AnalysisTimeout {
                        strategy: VerdictSource::Api.to_string(),
                        secs: timeout.as_secs(),
                    }
                } else {
                    failure(format!("request failed: {}", err.without_url()))
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .map_err(|err| failure(format!("failed to read response: {}", err)))?;
        if !status.is_success() {
            return Err(failure(format!("API error {}: {}", status, text.trim())));
        }
        debug!(bytes = text.len(), "Judge API responded");
        response_text(&text)
    }
}

fn request_body(batch: &CaptureBatch, prompt: &Prompt) -> Result<Value> {
    let mut parts = vec![json!({ "text": prompt.text() })];
    for image in &batch.images {
        let bytes = fs_err::read(image)
            .map_err(|err| failure(format!("failed to read screenshot: {}", err)))?;
        parts.push(json!({
            "inline_data": {
                "mime_type": "image/png",
                "data": BASE64.encode(bytes),
            }
        }));
    }
    Ok(json!({
        "contents": [{ "parts": parts }],
        "generationConfig": { "maxOutputTokens": MAX_OUTPUT_TOKENS },
    }))
}

fn response_text(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| failure(format!("response was not JSON: {}", err)))?;
    value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| failure(format!("response had no candidate text: {}", body.trim())))
}

fn failure(details: impl Into<String>) -> WardenError {
    WardenError::analysis(VerdictSource::Api.to_string(), details)
}
