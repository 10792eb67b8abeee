pub mod openai;

pub use openai::OpenAiProvider;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: usize,
    #[serde(default)]
    pub completion_tokens: usize,
    #[serde(default)]
    pub total_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCompletion {
    pub content: String,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    /// Reply text, annotated when the model stopped early.
    pub fn reply_text(&self) -> String {
        if self.finish_reason == "stop" {
            return self.content.clone();
        }
        let reason = match self.finish_reason.as_str() {
            "length" => "长度限制",
            "content_filter" => "内容过滤",
            _ => "未知原因",
        };
        format!("{}\n(因{reason}未返回完全)", self.content)
    }
}

/// Upstream chat-completion service. Callers apply their own timeout.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn create_chat_completion(
        &self,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion>;

    /// Cheap authenticated call used to validate a key.
    async fn list_models(&self, api_key: &str) -> Result<Vec<String>>;

    fn model(&self) -> &str;
}

/// Trims an upstream error body to something loggable and user-safe.
pub fn sanitize_api_error(body: &str) -> String {
    const MAX_CHARS: usize = 200;
    let trimmed = body.trim();
    let mut out: String = trimmed.chars().take(MAX_CHARS).collect();
    if trimmed.chars().count() > MAX_CHARS {
        out.push('…');
    }
    out
}
