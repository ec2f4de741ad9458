//! Native Gemini adapter: a pure translation layer over the generic
//! chat-completion request/response shape. No control-flow branches belong
//! in callers — they only ever see `AiClient`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AiClient, ChatResponse, ChatUsage, ImageResponse};

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: std::time::Duration,
}

pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(GeminiClient { http, config })
    }
}

/// Detects the Gemini wire shape from a base URL.
pub fn looks_like_gemini(base_url: &str) -> bool {
    base_url.contains("generativelanguage.googleapis.com") || base_url.contains("/v1beta/models")
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// role mapping assistant<->model; system messages concatenated into the
/// first user message.
fn build_contents(system: &str, user: &str) -> Vec<GeminiContent> {
    let merged_user = if system.is_empty() {
        user.to_string()
    } else {
        format!("{system}\n\n{user}")
    };
    vec![GeminiContent {
        role: "user",
        parts: vec![GeminiPart { text: merged_user }],
    }]
}

#[async_trait]
impl AiClient for GeminiClient {
    async fn chat_complete(&self, system: &str, user: &str, json_mode: bool) -> anyhow::Result<ChatResponse> {
        let body = GeminiRequest {
            contents: build_contents(system, user),
            generation_config: GenerationConfig {
                // JSON response mode is mapped to a MIME-type hint.
                response_mime_type: json_mode.then_some("application/json"),
            },
        };

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.config.base_url, self.config.model, self.config.api_key
        );
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GeminiResponse>()
            .await?;

        let text = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        let usage = resp.usage_metadata.unwrap_or_default();

        Ok(ChatResponse {
            text,
            usage: ChatUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            },
        })
    }

    async fn image_generate(&self, _prompt: &str) -> anyhow::Result<ImageResponse> {
        anyhow::bail!("Gemini adapter does not translate image generation in this deployment")
    }

    async fn summarize_images(&self, images: &[Vec<u8>], prompt: &str) -> anyhow::Result<ChatResponse> {
        use base64::Engine;
        let mut parts = vec![json!({"text": prompt})];
        for bytes in images {
            let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
            parts.push(json!({"inline_data": {"mime_type": "image/png", "data": b64}}));
        }
        let body = json!({
            "contents": [{"role": "user", "parts": parts}],
        });
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.config.base_url, self.config.model, self.config.api_key
        );
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GeminiResponse>()
            .await?;
        let text = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        Ok(ChatResponse {
            text,
            usage: ChatUsage { input_tokens: 0, output_tokens: 0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gemini_base_url() {
        assert!(looks_like_gemini("https://generativelanguage.googleapis.com/v1beta/models"));
        assert!(!looks_like_gemini("https://api.openai.com/v1"));
    }

    #[test]
    fn system_message_folds_into_first_user_message() {
        let contents = build_contents("be terse", "hello");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, "user");
        assert!(contents[0].parts[0].text.starts_with("be terse"));
    }

    #[test]
    fn no_system_message_is_passthrough() {
        let contents = build_contents("", "hello");
        assert_eq!(contents[0].parts[0].text, "hello");
    }
}
