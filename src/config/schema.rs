use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYSTEM_INIT_MESSAGE: &str =
    "You are ChatGPT, a large language model trained by OpenAI. Answer as concisely as possible.";
pub const DEFAULT_WELCOME_MESSAGE: &str =
    "欢迎关注！直接发送文字即可与 AI 对话，发送 /help 查看支持的命令。";

/// Top-level gateway configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path the config was read from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub openai: OpenAiConfig,
    /// `[[wechat]]` official-account instances.
    pub wechat: Vec<WeChatInstanceConfig>,
    /// `[[wework]]` WeCom application instances.
    pub wework: Vec<WeWorkInstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Verbose logging and extra `/system` output.
    pub debug_mode: bool,
    /// Reply with the user's own text without calling upstream.
    pub echo_mode: bool,
    /// Token accepted by the hidden `/adminAuth` command. Empty disables it.
    pub admin_auth_token: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            debug_mode: false,
            echo_mode: false,
            admin_auth_token: None,
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite database file; `~` is expanded.
    pub path: String,
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "~/.wxbridge/kv.db".into(),
            cleanup_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub chat_model: String,
    /// Timeout applied around every upstream call.
    pub timeout_ms: u64,
    pub api_key_min_len: usize,
    pub api_key_max_len: usize,
    /// Total token budget of one chat request.
    pub max_chat_tokens: usize,
    /// Tokens held back for the model's answer.
    pub min_response_tokens: usize,
    /// Stored turns considered for multi-turn history.
    pub max_history_turns: usize,
    pub system_init_message: String,
    pub welcome_message: String,
    /// Shared key handed to users without their own (free trial).
    pub guest_key: Option<String>,
    /// Key used by admins without their own.
    pub admin_key: Option<String>,
    pub attempt_ttl_secs: u64,
    pub answer_ttl_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            chat_model: "gpt-3.5-turbo".into(),
            timeout_ms: 30_000,
            api_key_min_len: 40,
            api_key_max_len: 200,
            max_chat_tokens: 4000,
            min_response_tokens: 500,
            max_history_turns: 20,
            system_init_message: DEFAULT_SYSTEM_INIT_MESSAGE.into(),
            welcome_message: DEFAULT_WELCOME_MESSAGE.into(),
            guest_key: None,
            admin_key: None,
            attempt_ttl_secs: 300,
            answer_ttl_secs: 300,
        }
    }
}

/// Timing constants for the delivery race, per platform instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// How long the platform waits for one HTTP response.
    pub request_timeout_ms: u64,
    /// Window over which the platform keeps redelivering the same message.
    pub retry_window_ms: u64,
    pub safety_margin_ms: u64,
    /// Pause before acknowledging an early timed-out attempt.
    pub slack_delay_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self::wechat()
    }
}

impl DeadlineConfig {
    /// WeChat waits 5s per attempt and retries three times.
    pub fn wechat() -> Self {
        Self {
            request_timeout_ms: 5_000,
            retry_window_ms: 15_000,
            safety_margin_ms: 500,
            slack_delay_ms: 2_000,
        }
    }

    pub fn wework() -> Self {
        Self {
            request_timeout_ms: 5_000,
            retry_window_ms: 15_000,
            safety_margin_ms: 1_000,
            slack_delay_ms: 2_000,
        }
    }

    /// Hard deadline for producing an HTTP response.
    pub fn response_deadline(&self) -> Duration {
        Duration::from_millis(
            self.request_timeout_ms
                .saturating_sub(self.safety_margin_ms),
        )
    }

    /// Time left to wait for an answer, measured from the first delivery.
    pub fn remaining_budget(&self, elapsed_since_first: Duration) -> Duration {
        Duration::from_millis(self.retry_window_ms)
            .saturating_sub(elapsed_since_first)
            .saturating_sub(Duration::from_millis(self.safety_margin_ms))
    }

    pub fn slack_delay(&self) -> Duration {
        Duration::from_millis(self.slack_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeChatInstanceConfig {
    /// Path segment in `/openai/wechat/{id}`.
    pub id: String,
    pub appid: String,
    pub token: String,
    /// EncodingAESKey; required for safe/compatible mode.
    #[serde(default)]
    pub aes_key: Option<String>,
    #[serde(default)]
    pub admin_user_ids: Vec<String>,
    #[serde(default)]
    pub guest_key: Option<String>,
    #[serde(default)]
    pub admin_key: Option<String>,
    #[serde(default = "DeadlineConfig::wechat")]
    pub deadline: DeadlineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeWorkInstanceConfig {
    pub id: String,
    pub corp_id: String,
    pub token: String,
    pub aes_key: String,
    #[serde(default)]
    pub admin_user_ids: Vec<String>,
    #[serde(default = "DeadlineConfig::wework")]
    pub deadline: DeadlineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_budget_subtracts_elapsed_and_margin() {
        let deadline = DeadlineConfig::wechat();
        assert_eq!(deadline.response_deadline(), Duration::from_millis(4_500));
        assert_eq!(
            deadline.remaining_budget(Duration::from_secs(5)),
            Duration::from_millis(9_500)
        );
        assert_eq!(deadline.remaining_budget(Duration::from_secs(20)), Duration::ZERO);
    }

    #[test]
    fn instance_tables_fill_platform_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [[wechat]]
            id = "main"
            appid = "wx123"
            token = "tok"

            [[wework]]
            id = "corp"
            corp_id = "ww123"
            token = "tok"
            aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG"

            [wework.deadline]
            safety_margin_ms = 800
            "#,
        )
        .unwrap();

        assert_eq!(parsed.wechat[0].deadline, DeadlineConfig::wechat());
        assert_eq!(parsed.wework[0].deadline.safety_margin_ms, 800);
        assert_eq!(parsed.wework[0].deadline.request_timeout_ms, 5_000);
        assert_eq!(parsed.gateway.port, 8787);
        assert_eq!(parsed.store.backend, StoreBackend::Memory);
    }
}
