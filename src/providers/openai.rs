use super::{sanitize_api_error, ChatCompletion, ChatMessage, ChatProvider, Usage};
use crate::config::OpenAiConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const LIST_MODELS_TIMEOUT: Duration = Duration::from_secs(3);

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.chat_model.clone(),
        })
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));

        let data: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        if let Some(message) = data
            .get("error")
            .and_then(|err| err.get("message"))
            .and_then(|msg| msg.as_str())
        {
            bail!("OpenAI 错误\n> {}", sanitize_api_error(message));
        }
        if !status.is_success() {
            bail!("OpenAI {what} failed ({status}): {}", sanitize_api_error(&body));
        }

        serde_json::from_value(data)
            .with_context(|| format!("invalid OpenAI {what} response: {}", sanitize_api_error(&body)))
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn create_chat_completion(
        &self,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("请求 OpenAI 异常")?;

        let parsed: CompletionResponse = Self::read_json(resp, "chat completion").await?;
        let Some(first) = parsed.choices.into_iter().next() else {
            bail!("OpenAI 返回异常\n> 数据为空");
        };
        let Some(message) = first.message else {
            bail!("OpenAI 返回异常\n> 数据为空");
        };

        Ok(ChatCompletion {
            content: message.content,
            finish_reason: first.finish_reason.unwrap_or_else(|| "unknown".into()),
            usage: parsed.usage,
        })
    }

    async fn list_models(&self, api_key: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/models", self.api_base))
            .bearer_auth(api_key)
            .timeout(LIST_MODELS_TIMEOUT)
            .send()
            .await
            .context("请求 OpenAI 异常")?;

        let parsed: ModelList = Self::read_json(resp, "list models").await?;
        Ok(parsed.data.into_iter().map(|model| model.id).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}
