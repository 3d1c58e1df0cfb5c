//! Inference adapter: wraps the external OCR capability behind one trait.
//!
//! Two backends are provided, selected at startup by configuration: a remote
//! batch inference server speaking a JSON protocol, and a local multimodal
//! LLM reached through the Ollama generate API. Both uphold the same
//! contract: one outcome per input image, in input order, never silently
//! dropping an entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

/// One recognized text line with the backend's confidence in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub confidence: f64,
}

/// Per-image inference result. A failed outcome never aborts the batch; the
/// worker resolves each job's fate independently.
#[derive(Debug, Clone)]
pub enum InferenceOutcome {
    Lines(Vec<TextLine>),
    Failed(OutcomeFailure),
}

/// Typed per-image failure. Timeout and BackendUnavailable are retryable;
/// CorruptInput is terminal for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeFailure {
    Timeout,
    CorruptInput,
    BackendUnavailable,
}

/// A batch OCR capability. Implementations must return exactly one outcome
/// per input image, ordered identically to the inputs.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(&self, images: &[Vec<u8>]) -> Vec<InferenceOutcome>;

    fn name(&self) -> &'static str;
}

/// Build the configured backend.
pub fn build_backend(config: &AppConfig) -> Result<Arc<dyn InferenceBackend>, InferenceError> {
    let timeout = Duration::from_secs(config.inference_timeout_secs);
    match config.inference_backend.as_str() {
        "remote" => Ok(Arc::new(RemoteOcrClient::new(
            &config.inference_url,
            timeout,
        )?)),
        "ollama" => Ok(Arc::new(OllamaOcrClient::new(
            &config.inference_url,
            &config.ollama_model,
            timeout,
        )?)),
        other => Err(InferenceError::Config(format!(
            "unknown inference backend '{other}' (expected 'remote' or 'ollama')"
        ))),
    }
}

// ── Remote batch inference server ────────────────────────────────────

#[derive(Serialize)]
struct BatchRequest {
    images: Vec<String>,
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<EntryResponse>,
}

#[derive(Deserialize)]
struct EntryResponse {
    #[serde(default)]
    lines: Vec<TextLine>,
    #[serde(default)]
    error: Option<String>,
}

fn entry_to_outcome(entry: EntryResponse) -> InferenceOutcome {
    match entry.error.as_deref() {
        None => InferenceOutcome::Lines(entry.lines),
        Some("timeout") => InferenceOutcome::Failed(OutcomeFailure::Timeout),
        Some("corrupt_input") => InferenceOutcome::Failed(OutcomeFailure::CorruptInput),
        Some(_) => InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable),
    }
}

/// Client for a remote OCR inference server exposing a batch endpoint. The
/// whole batch goes out in one call so per-call overhead is amortized.
pub struct RemoteOcrClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RemoteOcrClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(InferenceError::Http)?;
        Ok(Self {
            http,
            endpoint: format!("{}/v1/ocr/batch", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl InferenceBackend for RemoteOcrClient {
    async fn infer(&self, images: &[Vec<u8>]) -> Vec<InferenceOutcome> {
        let request = BatchRequest {
            images: images
                .iter()
                .map(|img| base64::engine::general_purpose::STANDARD.encode(img))
                .collect(),
        };

        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let failure = if e.is_timeout() {
                    OutcomeFailure::Timeout
                } else {
                    OutcomeFailure::BackendUnavailable
                };
                tracing::warn!(error = %e, "inference request failed");
                return vec![InferenceOutcome::Failed(failure); images.len()];
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "inference server returned error status");
            return vec![InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable); images.len()];
        }

        let batch: BatchResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "inference response was not valid JSON");
                return vec![
                    InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable);
                    images.len()
                ];
            }
        };

        let mut outcomes: Vec<InferenceOutcome> =
            batch.results.into_iter().map(entry_to_outcome).collect();
        if outcomes.len() != images.len() {
            tracing::warn!(
                expected = images.len(),
                got = outcomes.len(),
                "inference server violated one-outcome-per-input; padding"
            );
            outcomes.resize(
                images.len(),
                InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable),
            );
        }
        outcomes
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

// ── Local multimodal LLM via Ollama ──────────────────────────────────

const OLLAMA_PROMPT: &str = concat!(
    "Transcribe every line of text visible in this image. ",
    "Return ONLY a valid JSON object of the form ",
    "{\"lines\": [{\"text\": \"...\", \"confidence\": 0.0}]} ",
    "where confidence is your certainty for that line in [0, 1]. ",
    "Do not include markdown formatting like ```json."
);

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Deserialize)]
struct OllamaLines {
    lines: Vec<TextLine>,
}

fn parse_ollama_response(raw: &str) -> InferenceOutcome {
    match serde_json::from_str::<OllamaLines>(raw) {
        Ok(parsed) => InferenceOutcome::Lines(parsed.lines),
        // The model emitted something that is not the requested schema;
        // retrying the same image through the same model rarely helps.
        Err(_) => InferenceOutcome::Failed(OutcomeFailure::CorruptInput),
    }
}

/// Client for a local multimodal LLM served by Ollama. The generate API is
/// single-image, so the adapter iterates internally while still presenting
/// the batch contract to the worker.
pub struct OllamaOcrClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaOcrClient {
    pub fn new(host: &str, model: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(InferenceError::Http)?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/generate", host.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    async fn infer_one(&self, image: &[u8]) -> InferenceOutcome {
        let request = OllamaRequest {
            model: &self.model,
            prompt: OLLAMA_PROMPT,
            images: vec![base64::engine::general_purpose::STANDARD.encode(image)],
            stream: false,
            format: "json",
        };

        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return InferenceOutcome::Failed(OutcomeFailure::Timeout),
            Err(e) => {
                tracing::warn!(error = %e, model = %self.model, "ollama request failed");
                return InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable);
            }
        };

        if !response.status().is_success() {
            return InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable);
        }

        match response.json::<OllamaResponse>().await {
            Ok(body) => parse_ollama_response(&body.response),
            Err(_) => InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable),
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaOcrClient {
    async fn infer(&self, images: &[Vec<u8>]) -> Vec<InferenceOutcome> {
        // The model host serializes GPU work; sequential requests keep memory
        // bounded while preserving input order.
        let mut outcomes = Vec::with_capacity(images.len());
        for image in images {
            outcomes.push(self.infer_one(image).await);
        }
        outcomes
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_without_error_maps_to_lines() {
        let entry = EntryResponse {
            lines: vec![TextLine { text: "68".into(), confidence: 0.99 }],
            error: None,
        };
        match entry_to_outcome(entry) {
            InferenceOutcome::Lines(lines) => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines[0].text, "68");
            }
            other => panic!("expected lines, got {other:?}"),
        }
    }

    #[test]
    fn entry_errors_map_to_typed_failures() {
        for (error, expected) in [
            ("timeout", OutcomeFailure::Timeout),
            ("corrupt_input", OutcomeFailure::CorruptInput),
            ("gpu_oom", OutcomeFailure::BackendUnavailable),
        ] {
            let entry = EntryResponse { lines: vec![], error: Some(error.to_string()) };
            match entry_to_outcome(entry) {
                InferenceOutcome::Failed(failure) => assert_eq!(failure, expected),
                other => panic!("expected failure for '{error}', got {other:?}"),
            }
        }
    }

    #[test]
    fn ollama_json_parses_to_lines() {
        let raw = r#"{"lines": [{"text": "ORCHARD CLOSE", "confidence": 0.97}]}"#;
        match parse_ollama_response(raw) {
            InferenceOutcome::Lines(lines) => assert_eq!(lines[0].text, "ORCHARD CLOSE"),
            other => panic!("expected lines, got {other:?}"),
        }
    }

    #[test]
    fn ollama_prose_is_corrupt_input() {
        match parse_ollama_response("I see a house number that reads 68.") {
            InferenceOutcome::Failed(OutcomeFailure::CorruptInput) => {}
            other => panic!("expected corrupt input, got {other:?}"),
        }
    }
}
