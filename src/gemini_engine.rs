use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::classifier::{ClassifyError, Classifier};
use crate::types::{ImagePayload, StyleClassification};

const PROMPT: &str = "\
Analyze this tattoo image and provide:
1. Primary tattoo style (most likely style)
2. Secondary tattoo style (another possible style)
3. Detailed description of the tattoo's content and special features

Format your response exactly like this, with each item on a new line:
Primary: [style]
Secondary: [style]
Description: [detailed description]";

const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub request_timeout: Duration,
}

pub struct GeminiClassifier {
    client: Client,
    config: GeminiConfig,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part<'a> {
    Text(&'a str),
    InlineData(InlineData<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GeminiClassifier {
    #[tracing::instrument(skip(config), fields(model = %config.model))]
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    #[tracing::instrument(skip(self, image), fields(mime_type = image.mime_type, bytes = image.bytes.len()))]
    async fn classify(&self, image: &ImagePayload) -> Result<StyleClassification, ClassifyError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text(PROMPT),
                    Part::InlineData(InlineData {
                        mime_type: image.mime_type,
                        data: STANDARD.encode(&image.bytes),
                    }),
                ],
            }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifyError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifyError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let response: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifyError::MalformedResponse(e.to_string()))?;
        let reply = reply_text(response)?;
        tracing::debug!(reply_len = reply.len(), "Received classification");
        parse_reply(&reply)
    }
}

fn status_error(status: StatusCode, body: &str) -> ClassifyError {
    let detail: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    let message = format!("HTTP {status}: {detail}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClassifyError::RateLimited(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClassifyError::Unauthorized(message),
        StatusCode::BAD_REQUEST if body.contains("API_KEY_INVALID") => {
            ClassifyError::Unauthorized(message)
        }
        StatusCode::REQUEST_TIMEOUT => ClassifyError::Network(message),
        s if s.is_client_error() => ClassifyError::InvalidInput(message),
        _ => ClassifyError::Network(message),
    }
}

fn reply_text(response: GenerateResponse) -> Result<String, ClassifyError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ClassifyError::InvalidInput(format!(
            "prompt blocked: {reason}"
        )));
    }
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ClassifyError::MalformedResponse("response has no candidates".into()))?;
    if candidate.finish_reason.as_deref() == Some("SAFETY") {
        return Err(ClassifyError::InvalidInput(
            "response withheld by safety filter".into(),
        ));
    }
    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ClassifyError::MalformedResponse(
            "candidate has no text".into(),
        ));
    }
    Ok(text)
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Primary,
    Secondary,
    Description,
}

/// Parses the `Primary:` / `Secondary:` / `Description:` reply. Labels may
/// appear in any order and wrapped in markdown emphasis; description text
/// continues across following unlabeled lines.
fn parse_reply(reply: &str) -> Result<StyleClassification, ClassifyError> {
    let mut primary = None;
    let mut secondary = None;
    let mut description: Option<String> = None;
    let mut last = None;

    for line in reply.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '#', ' ']);
        if line.is_empty() {
            continue;
        }
        let labeled = line.split_once(':').and_then(|(label, value)| {
            let label = label.trim_matches(|c: char| c == '*' || c.is_whitespace());
            let field = match label.to_ascii_lowercase().as_str() {
                "primary" | "primary style" => Field::Primary,
                "secondary" | "secondary style" => Field::Secondary,
                "description" => Field::Description,
                _ => return None,
            };
            Some((field, value.trim_matches(|c: char| c == '*' || c.is_whitespace())))
        });

        match labeled {
            Some((Field::Primary, value)) => primary = Some(value.to_string()),
            Some((Field::Secondary, value)) => secondary = Some(value.to_string()),
            Some((Field::Description, value)) => description = Some(value.to_string()),
            None => {
                if last == Some(Field::Description) {
                    if let Some(text) = description.as_mut() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(line);
                    }
                }
                continue;
            }
        }
        last = labeled.map(|(field, _)| field);
    }

    let missing = |name: &str| ClassifyError::MalformedResponse(format!("reply has no {name}"));
    let primary = primary.filter(|s| !s.is_empty()).ok_or_else(|| missing("primary style"))?;
    let secondary = secondary.ok_or_else(|| missing("secondary style"))?;
    let description = description.ok_or_else(|| missing("description"))?;

    Ok(StyleClassification {
        primary_style: primary,
        secondary_style: secondary,
        description,
    })
}
