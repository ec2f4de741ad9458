//! OpenAI-compatible chat-completions + image-generation client. Endpoint
//! URLs default to this shape but accept substitutions (localhost proxies).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AiClient, ChatResponse, ChatUsage, ImageResponse};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub image_api_key: Option<String>,
    pub model: String,
    pub image_model: String,
    /// Per-call HTTP timeout.
    pub timeout: std::time::Duration,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(OpenAiClient { http, config })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ImageGenResponse {
    data: Vec<ImageGenDatum>,
}

#[derive(Deserialize)]
struct ImageGenDatum {
    b64_json: Option<String>,
    url: Option<String>,
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn chat_complete(&self, system: &str, user: &str, json_mode: bool) -> anyhow::Result<ChatResponse> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: user });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            response_format: json_mode.then(|| json!({"type": "json_object"})),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatCompletionResponse>()
            .await?;

        let text = resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let usage = resp.usage.unwrap_or_default();

        Ok(ChatResponse {
            text,
            usage: ChatUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }

    async fn image_generate(&self, prompt: &str) -> anyhow::Result<ImageResponse> {
        let key = self.config.image_api_key.as_ref().unwrap_or(&self.config.api_key);
        let resp = self
            .http
            .post(format!("{}/images/generations", self.config.base_url))
            .bearer_auth(key)
            .json(&json!({
                "model": self.config.image_model,
                "prompt": prompt,
                "response_format": "b64_json",
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<ImageGenResponse>()
            .await?;

        let datum = resp
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("image endpoint returned no data"))?;

        if let Some(b64) = datum.b64_json {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
            return Ok(ImageResponse { bytes });
        }
        if let Some(url) = datum.url {
            let bytes = self.http.get(url).send().await?.error_for_status()?.bytes().await?;
            return Ok(ImageResponse { bytes: bytes.to_vec() });
        }
        anyhow::bail!("image endpoint returned neither b64_json nor url")
    }

    async fn summarize_images(&self, images: &[Vec<u8>], prompt: &str) -> anyhow::Result<ChatResponse> {
        use base64::Engine;
        let content: Vec<serde_json::Value> = std::iter::once(json!({"type": "text", "text": prompt}))
            .chain(images.iter().map(|bytes| {
                let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                json!({"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{b64}")}})
            }))
            .collect();

        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": content}],
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatCompletionResponse>()
            .await?;

        let text = resp.choices.into_iter().next().map(|c| c.message.content).unwrap_or_default();
        let usage = resp.usage.unwrap_or_default();
        Ok(ChatResponse {
            text,
            usage: ChatUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }
}
