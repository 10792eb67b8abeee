pub mod schema;

pub use schema::{
    Config, DeadlineConfig, GatewayConfig, OpenAiConfig, StoreBackend, StoreConfig,
    WeChatInstanceConfig, WeWorkInstanceConfig,
};

use crate::security::MessageCrypto;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "WXBRIDGE";

/// `~/.wxbridge/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".wxbridge").join("config.toml"))
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl Config {
    /// Reads, applies `WXBRIDGE_*` overrides and validates.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut parsed: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parsed.config_path = path;

        parsed.apply_env_overrides();
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}_{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(host) = var("HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = var("PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::error!("{ENV_PREFIX}_PORT invalid number {port}"),
            }
        }
        if let Some(flag) = var("DEBUG_MODE") {
            apply_bool("DEBUG_MODE", &flag, &mut self.gateway.debug_mode);
        }
        if let Some(flag) = var("ECHO_MODE") {
            apply_bool("ECHO_MODE", &flag, &mut self.gateway.echo_mode);
        }
        if let Some(token) = var("ADMIN_AUTH_TOKEN") {
            self.gateway.admin_auth_token = Some(token);
        }
        if let Some(base) = var("OPENAI_API_BASE") {
            self.openai.api_base = base;
        }
        if let Some(model) = var("OPENAI_CHAT_MODEL") {
            self.openai.chat_model = model;
        }
        if let Some(key) = var("OPENAI_GUEST_KEY") {
            self.openai.guest_key = Some(key);
        }
        if let Some(key) = var("OPENAI_ADMIN_KEY") {
            self.openai.admin_key = Some(key);
        }

        for instance in &mut self.wechat {
            let prefix = format!("WECHAT_{}", instance.id.to_ascii_uppercase());
            if let Some(token) = var(&format!("{prefix}_TOKEN")) {
                instance.token = token;
            }
            if let Some(key) = var(&format!("{prefix}_AES_KEY")) {
                instance.aes_key = Some(key);
            }
            if let Some(key) = var(&format!("{prefix}_GUEST_KEY")) {
                instance.guest_key = Some(key);
            }
            if let Some(key) = var(&format!("{prefix}_ADMIN_KEY")) {
                instance.admin_key = Some(key);
            }
        }
        for instance in &mut self.wework {
            let prefix = format!("WEWORK_{}", instance.id.to_ascii_uppercase());
            if let Some(token) = var(&format!("{prefix}_TOKEN")) {
                instance.token = token;
            }
            if let Some(key) = var(&format!("{prefix}_AES_KEY")) {
                instance.aes_key = key;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wechat.is_empty() && self.wework.is_empty() {
            bail!("no [[wechat]] or [[wework]] instance configured");
        }
        if self.openai.api_key_min_len > self.openai.api_key_max_len {
            bail!("openai.api_key_min_len is greater than openai.api_key_max_len");
        }
        if self.openai.min_response_tokens >= self.openai.max_chat_tokens {
            bail!("openai.min_response_tokens must be below openai.max_chat_tokens");
        }

        let mut seen = HashSet::new();
        for instance in &self.wechat {
            if !seen.insert(("wechat", instance.id.as_str())) {
                bail!("duplicate wechat instance id `{}`", instance.id);
            }
            check_instance("wechat", &instance.id, &instance.appid, &instance.token)?;
            if let Some(key) = &instance.aes_key {
                MessageCrypto::new(key)
                    .with_context(|| format!("wechat instance `{}` aes_key", instance.id))?;
            }
        }
        for instance in &self.wework {
            if !seen.insert(("wework", instance.id.as_str())) {
                bail!("duplicate wework instance id `{}`", instance.id);
            }
            check_instance("wework", &instance.id, &instance.corp_id, &instance.token)?;
            MessageCrypto::new(&instance.aes_key)
                .with_context(|| format!("wework instance `{}` aes_key", instance.id))?;
        }
        Ok(())
    }
}

fn check_instance(platform: &str, id: &str, account_id: &str, token: &str) -> Result<()> {
    if id.trim().is_empty() || id.contains('/') {
        bail!("{platform} instance id `{id}` is not a valid path segment");
    }
    if account_id.trim().is_empty() || token.trim().is_empty() {
        bail!("{platform} instance `{id}` needs both an account id and a token");
    }
    Ok(())
}

fn apply_bool(name: &str, raw: &str, target: &mut bool) {
    match raw {
        "true" => *target = true,
        "false" => *target = false,
        other => tracing::error!("{ENV_PREFIX}_{name} invalid bool {other}"),
    }
}
