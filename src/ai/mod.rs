//! Heterogeneous AI endpoint capability: `{chat_complete, image_generate}`
//! as a swappable trait, with an OpenAI-compatible implementation and a
//! pure-translation Gemini adapter.

pub mod gemini;
pub mod openai;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ChatUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub bytes: Vec<u8>,
}

/// The endpoint capability every phase calls through. Implementations must
/// be safe for concurrent calls up to the worker pool width.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn chat_complete(&self, system: &str, user: &str, json_mode: bool) -> anyhow::Result<ChatResponse>;

    /// Convenience for matcher/analyze call sites that only need the text,
    /// already asking for a JSON response.
    async fn chat_complete_json(&self, prompt: &str) -> anyhow::Result<String> {
        Ok(self.chat_complete("", prompt, true).await?.text)
    }

    async fn image_generate(&self, prompt: &str) -> anyhow::Result<ImageResponse>;

    /// Vision-capable summarization used by the style bootstrap.
    async fn summarize_images(&self, images: &[Vec<u8>], prompt: &str) -> anyhow::Result<ChatResponse>;
}

#[cfg(test)]
pub use test_support::MockAiClient;

#[cfg(test)]
mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic stand-in for integration tests: either replays a fixed
    /// sequence of JSON replies, or always errors.
    pub struct MockAiClient {
        replies: Mutex<Vec<String>>,
        cursor: AtomicUsize,
        fail: bool,
    }

    impl MockAiClient {
        pub fn json_replies(replies: Vec<String>) -> Self {
            MockAiClient {
                replies: Mutex::new(replies),
                cursor: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            MockAiClient {
                replies: Mutex::new(vec![]),
                cursor: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl AiClient for MockAiClient {
        async fn chat_complete(&self, _system: &str, _user: &str, _json_mode: bool) -> anyhow::Result<ChatResponse> {
            if self.fail {
                anyhow::bail!("mock client configured to fail");
            }
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let replies = self.replies.lock().unwrap();
            let text = replies
                .get(idx)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("mock client exhausted its scripted replies"))?;
            Ok(ChatResponse {
                text,
                usage: ChatUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            })
        }

        async fn image_generate(&self, _prompt: &str) -> anyhow::Result<ImageResponse> {
            if self.fail {
                anyhow::bail!("mock client configured to fail");
            }
            Ok(ImageResponse {
                bytes: vec![0u8; 16],
            })
        }

        async fn summarize_images(&self, _images: &[Vec<u8>], _prompt: &str) -> anyhow::Result<ChatResponse> {
            self.chat_complete("", "", true).await
        }
    }
}
