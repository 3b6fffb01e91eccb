//! Enrichment service abstraction and implementations.
//!
//! The enrichment service is an opaque function from a question record to
//! derived fields. This module defines the [`EnrichmentService`] trait and:
//! - **[`DisabledService`]**: fails every call; used when no provider is configured.
//! - **[`OpenAIService`]**: calls an OpenAI-compatible chat-completions
//!   endpoint and parses a JSON object out of the reply.
//!
//! Services make exactly one attempt per call. Pacing, timeouts and
//! retries are applied by the engine around them, which is why every
//! failure is mapped onto [`PipelineError`]:
//! - HTTP 429, 408 and 5xx, timeouts, connection failures → transient
//! - HTTP 401/403 → `Auth`
//! - other 4xx → `Rejected`
//! - a reply that does not contain the expected JSON → `MalformedResponse`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use course_harness_core::models::{fields, FieldMap, FieldValue, Record, RecordRef};

use crate::config::EnrichmentConfig;
use crate::error::{PipelineError, TransientKind};

/// Payload sent to the enrichment service for one question.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub reference: RecordRef,
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: i64,
    /// Title of the owning course, when known. Gives the model context.
    pub course_title: Option<String>,
}

impl EnrichmentRequest {
    /// Build a request from a question record that already passed shape validation.
    pub fn from_record(record: &Record, course_title: Option<String>) -> Result<Self, PipelineError> {
        use course_harness_core::validate::ShapeIssue;
        Ok(Self {
            reference: record.reference.clone(),
            question: record
                .text(fields::QUESTION)
                .ok_or(PipelineError::DataShape(ShapeIssue::MissingQuestionText))?
                .to_string(),
            options: record
                .text_list(fields::OPTIONS)
                .ok_or(PipelineError::DataShape(ShapeIssue::MissingOptions))?
                .to_vec(),
            correct_answer: record
                .integer(fields::CORRECT_ANSWER)
                .ok_or(PipelineError::DataShape(ShapeIssue::MissingCorrectAnswer))?,
            course_title,
        })
    }
}

#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// Identifier used in logs and health output.
    fn name(&self) -> &str;

    /// Derive new fields for one question. One attempt, no retry.
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<FieldMap, PipelineError>;

    /// Cheap reachability check used by the health checker.
    async fn probe(&self) -> Result<(), PipelineError>;
}

/// Build the service selected by `enrichment.provider`.
pub fn create_service(config: &EnrichmentConfig) -> Result<Arc<dyn EnrichmentService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledService)),
        "openai" => Ok(Arc::new(OpenAIService::new(config)?)),
        other => bail!("Unknown enrichment provider: {}", other),
    }
}

// ============ Disabled Service ============

/// Used when `enrichment.provider = "disabled"`. Every call fails.
pub struct DisabledService;

#[async_trait]
impl EnrichmentService for DisabledService {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn enrich(&self, _request: &EnrichmentRequest) -> Result<FieldMap, PipelineError> {
        Err(PipelineError::Disabled)
    }

    async fn probe(&self) -> Result<(), PipelineError> {
        Err(PipelineError::Disabled)
    }
}

// ============ OpenAI-compatible Service ============

const SYSTEM_PROMPT: &str = "You enrich multiple-choice quiz questions for a learning platform. \
Reply with a single JSON object with exactly these keys: \
\"explanation\" (string, two to four sentences explaining why the correct option is right), \
\"difficulty\" (one of \"easy\", \"medium\", \"hard\"), \
\"tags\" (array of one to five short lowercase strings).";

/// Chat-completions client for OpenAI or any compatible endpoint.
///
/// The API key is read from the environment variable named by
/// `enrichment.api_key_env` (default `OPENAI_API_KEY`).
pub struct OpenAIService {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAIService {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.model required for OpenAI provider"))?;

        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn user_prompt(request: &EnrichmentRequest) -> String {
        let mut prompt = String::new();
        if let Some(title) = &request.course_title {
            prompt.push_str(&format!("Course: {}\n", title));
        }
        prompt.push_str(&format!("Question: {}\n", request.question));
        for (i, option) in request.options.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i, option));
        }
        prompt.push_str(&format!("Correct option: {}\n", request.correct_answer));
        prompt
    }
}

fn classify_transport_error(e: reqwest::Error) -> PipelineError {
    if e.is_timeout() {
        PipelineError::transient(TransientKind::Timeout, e.to_string())
    } else {
        PipelineError::transient(TransientKind::Network, e.to_string())
    }
}

#[async_trait]
impl EnrichmentService for OpenAIService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<FieldMap, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::user_prompt(request) },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status(status.as_u16(), &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                PipelineError::MalformedResponse("missing choices[0].message.content".into())
            })?;

        parse_enrichment(content)
    }

    async fn probe(&self) -> Result<(), PipelineError> {
        let response = self
            .client
            .get(format!("{}/models", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(PipelineError::from_http_status(status.as_u16(), &text))
        }
    }
}

const DIFFICULTIES: &[&str] = &["easy", "medium", "hard"];

/// Parse the JSON object returned by the model into derived fields.
pub fn parse_enrichment(content: &str) -> Result<FieldMap, PipelineError> {
    let value: serde_json::Value = serde_json::from_str(content.trim())
        .map_err(|e| PipelineError::MalformedResponse(format!("reply is not JSON: {}", e)))?;

    let explanation = value
        .get("explanation")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::MalformedResponse("missing explanation".into()))?;

    let difficulty = value
        .get("difficulty")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| DIFFICULTIES.contains(&s.as_str()))
        .ok_or_else(|| PipelineError::MalformedResponse("missing or unknown difficulty".into()))?;

    let tags: Vec<String> = value
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut out = FieldMap::new();
    out.insert(fields::EXPLANATION.into(), FieldValue::Text(explanation.to_string()));
    out.insert(fields::DIFFICULTY.into(), FieldValue::Text(difficulty));
    out.insert(fields::TAGS.into(), FieldValue::TextList(tags));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let out = parse_enrichment(
            r#"{"explanation": "Because 2+2=4.", "difficulty": "Easy", "tags": ["Arithmetic", " "]}"#,
        )
        .unwrap();
        assert_eq!(out[fields::DIFFICULTY], FieldValue::Text("easy".into()));
        assert_eq!(
            out[fields::TAGS],
            FieldValue::TextList(vec!["arithmetic".into()])
        );
    }

    #[test]
    fn rejects_non_json_and_missing_keys() {
        assert!(matches!(
            parse_enrichment("Sure! Here is the explanation"),
            Err(PipelineError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_enrichment(r#"{"difficulty": "hard"}"#),
            Err(PipelineError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_enrichment(r#"{"explanation": "x", "difficulty": "impossible"}"#),
            Err(PipelineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn request_from_record() {
        let mut f = FieldMap::new();
        f.insert(fields::QUESTION.into(), "What is Rust?".into());
        f.insert(
            fields::OPTIONS.into(),
            FieldValue::TextList(vec!["A language".into(), "A metal oxide".into()]),
        );
        f.insert(fields::CORRECT_ANSWER.into(), FieldValue::Integer(0));
        let r = Record::new(RecordRef::child("c", "q"), f);
        let req = EnrichmentRequest::from_record(&r, Some("Systems".into())).unwrap();
        assert_eq!(req.options.len(), 2);
        let prompt = OpenAIService::user_prompt(&req);
        assert!(prompt.starts_with("Course: Systems\n"));
        assert!(prompt.contains("1. A metal oxide"));
    }

    #[tokio::test]
    async fn disabled_service_always_fails() {
        let svc = DisabledService;
        assert!(matches!(svc.probe().await, Err(PipelineError::Disabled)));
    }
}
