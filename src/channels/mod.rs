pub mod envelope;
pub mod reply;
pub mod wechat;
pub mod wework;

pub use envelope::{
    parse_envelope, EnvelopeRules, InboundHeader, MessageSchema, ParsedEnvelope, TypedMessage,
};
pub use wechat::WeChatPlatform;
pub use wework::WeWorkPlatform;

use crate::config::{DeadlineConfig, OpenAiConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::security::{crypto::random_nonce, MessageCrypto};
use std::collections::HashMap;
use std::fmt;

/// Which callback dialect an instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    WeChat,
    WeWork,
}

impl PlatformKind {
    /// Path segment and store key component.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WeChat => "wechat",
            Self::WeWork => "wework",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared key a sender may borrow when they have not bound their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackKey {
    pub api_key: String,
    /// Guest keys mark the sender as a free-trial user; admin keys do not.
    pub free_trial: bool,
}

impl FallbackKey {
    fn guest(key: &Option<String>) -> Option<Self> {
        non_empty(key).map(|api_key| Self {
            api_key,
            free_trial: true,
        })
    }

    fn admin(key: &Option<String>, is_admin: bool) -> Option<Self> {
        if !is_admin {
            return None;
        }
        non_empty(key).map(|api_key| Self {
            api_key,
            free_trial: false,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Capabilities one callback dialect provides to the shared pipeline.
pub trait Platform: Send + Sync + 'static {
    const KIND: PlatformKind;

    fn id(&self) -> &str;
    /// Account id expected in envelopes and ciphertext tails.
    fn account_id(&self) -> &str;
    fn token(&self) -> &str;
    fn crypto(&self) -> Option<&MessageCrypto>;
    fn deadline(&self) -> &DeadlineConfig;
    fn rules(&self) -> &'static EnvelopeRules;
    fn admin_user_ids(&self) -> &[String];

    /// Whether admins granted through `/adminAuth` count on this platform.
    fn honors_admin_grants(&self) -> bool;

    /// Answers the URL verification GET with the body to send back.
    fn handshake(&self, params: &HashMap<String, String>) -> GatewayResult<String>;

    /// Key used when the sender has none of their own, in fallback order.
    fn fallback_key(&self, openai: &OpenAiConfig, is_admin: bool) -> Option<FallbackKey>;

    /// `AgentID` echoed in replies.
    fn reply_agent_id<'a>(&self, header: &'a InboundHeader) -> Option<&'a str>;

    fn parse_envelope(
        &self,
        xml: &str,
        params: &HashMap<String, String>,
    ) -> GatewayResult<ParsedEnvelope> {
        envelope::parse_envelope(
            xml,
            params,
            self.account_id(),
            self.token(),
            self.crypto(),
            self.rules(),
        )
    }

    fn build_plain_reply(&self, header: &InboundHeader, content: &str) -> String {
        reply::build_text_reply(
            header,
            content,
            chrono::Utc::now().timestamp(),
            self.reply_agent_id(header),
        )
    }

    fn build_encrypted_reply(&self, plain_xml: &str) -> GatewayResult<String> {
        let crypto = self.crypto().ok_or_else(|| {
            GatewayError::configuration("encrypted reply requested without EncodingAESKey")
        })?;
        reply::build_encrypted_reply(
            crypto,
            plain_xml,
            self.account_id(),
            self.token(),
            chrono::Utc::now().timestamp(),
            &random_nonce(),
        )
    }

    /// Final response body: the reply is encrypted when the request was.
    fn render_reply(&self, envelope: &ParsedEnvelope, content: &str) -> GatewayResult<String> {
        let plain = self.build_plain_reply(&envelope.header, content);
        if envelope.is_encrypted {
            self.build_encrypted_reply(&plain)
        } else {
            Ok(plain)
        }
    }

    fn is_admin_user(&self, user_id: &str) -> bool {
        self.admin_user_ids().iter().any(|id| id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_keys_ignore_blank_values() {
        assert!(FallbackKey::guest(&Some("  ".into())).is_none());
        assert!(FallbackKey::admin(&Some("sk-admin".into()), false).is_none());

        let admin = FallbackKey::admin(&Some("sk-admin".into()), true).unwrap();
        assert!(!admin.free_trial);
        assert!(FallbackKey::guest(&Some("sk-guest".into())).unwrap().free_trial);
    }

    #[test]
    fn platform_kind_names_match_routes() {
        assert_eq!(PlatformKind::WeChat.to_string(), "wechat");
        assert_eq!(PlatformKind::WeWork.as_str(), "wework");
    }
}
