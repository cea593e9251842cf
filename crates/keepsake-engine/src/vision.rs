use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::truncate_text;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const DESCRIBE_PROMPT: &str = "Describe this photo in one or two sentences for an \
interior redesign brief. Name the room type, the dominant colors, and the lighting. \
Plain prose only.";

/// Vision-capable completion API used for photo description and for the
/// caption-presence check in the verification loop.
pub trait SceneAnalyzer: Send + Sync {
    fn describe(&self, image: &[u8], mime: &str) -> Result<String>;
    fn caption_visible(&self, image: &[u8], mime: &str, phrase: &str) -> Result<bool>;
}

/// Anthropic messages API client. One image block plus one text block per
/// request, base64 payload, bounded by a client timeout.
pub struct AnthropicVision {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl AnthropicVision {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_base = env::var("ANTHROPIC_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let model = env::var("KEEPSAKE_VISION_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build vision HTTP client")?;
        Ok(Self {
            api_base,
            api_key: api_key.into(),
            model,
            http,
        })
    }

    fn request_text(&self, prompt: &str, image: &[u8], mime: &str) -> Result<String> {
        let endpoint = format!("{}/messages", self.api_base);
        let payload = json!({
            "model": self.model,
            "max_tokens": 1024,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": mime,
                            "data": BASE64.encode(image),
                        },
                    },
                    { "type": "text", "text": prompt },
                ],
            }],
        });
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .with_context(|| format!("vision request failed ({endpoint})"))?;
        let parsed = response_json_or_error("vision", response)?;
        let text = extract_message_text(&parsed);
        if text.trim().is_empty() {
            bail!("vision response contained no text");
        }
        Ok(text)
    }
}

impl SceneAnalyzer for AnthropicVision {
    fn describe(&self, image: &[u8], mime: &str) -> Result<String> {
        self.request_text(DESCRIBE_PROMPT, image, mime)
    }

    fn caption_visible(&self, image: &[u8], mime: &str, phrase: &str) -> Result<bool> {
        let prompt = format!(
            "Does this image visibly contain the exact text \"{phrase}\"? \
Answer with the single word YES or NO."
        );
        let answer = self.request_text(&prompt, image, mime)?;
        Ok(is_affirmative(&answer))
    }
}

fn extract_message_text(response: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(text) = obj.get("text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                parts.push(text.trim().to_string());
            }
        }
    }
    parts.join("\n")
}

fn is_affirmative(answer: &str) -> bool {
    answer
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_alphabetic())
        .to_ascii_uppercase()
        .starts_with("YES")
}

pub(crate) fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        bail!(
            "{label} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{label} response was not valid JSON"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_message_text_joins_text_blocks() {
        let response = json!({
            "content": [
                { "type": "text", "text": "A bright kitchen." },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "Warm afternoon light." },
            ],
        });
        assert_eq!(
            extract_message_text(&response),
            "A bright kitchen.\nWarm afternoon light."
        );
    }

    #[test]
    fn extract_message_text_handles_missing_content() {
        assert_eq!(extract_message_text(&json!({})), "");
        assert_eq!(extract_message_text(&json!({ "content": "nope" })), "");
    }

    #[test]
    fn affirmative_answers_are_detected_loosely() {
        assert!(is_affirmative("YES"));
        assert!(is_affirmative("yes, the caption is clearly visible"));
        assert!(is_affirmative("  \"Yes\""));
        assert!(!is_affirmative("NO"));
        assert!(!is_affirmative("The text is not present"));
    }
}
