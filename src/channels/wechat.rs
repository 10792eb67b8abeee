//! Official-account (公众号) callbacks.
//!
//! Plain, compatible and safe modes are all accepted: every POST carries a
//! `signature` over the token, and safe-mode bodies additionally carry an
//! `Encrypt` blob signed with `msg_signature`.

use super::envelope::{
    self, build_event, build_image, build_link, build_location, build_short_video, build_text,
    build_video, build_voice, EnvelopeRules, InboundHeader, MessageSchema, ParsedEnvelope,
};
use super::{FallbackKey, Platform, PlatformKind};
use crate::config::{DeadlineConfig, OpenAiConfig, WeChatInstanceConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::security::{check_signature, MessageCrypto, MSG_SIGNATURE_FIELD, SIGNATURE_FIELD};
use std::collections::HashMap;

static WECHAT_SCHEMAS: &[MessageSchema] = &[
    MessageSchema {
        msg_type: "text",
        requires_msg_id: true,
        build: build_text,
    },
    MessageSchema {
        msg_type: "image",
        requires_msg_id: true,
        build: build_image,
    },
    MessageSchema {
        msg_type: "voice",
        requires_msg_id: true,
        build: build_voice,
    },
    MessageSchema {
        msg_type: "video",
        requires_msg_id: true,
        build: build_video,
    },
    MessageSchema {
        msg_type: "shortvideo",
        requires_msg_id: true,
        build: build_short_video,
    },
    MessageSchema {
        msg_type: "location",
        requires_msg_id: true,
        build: build_location,
    },
    MessageSchema {
        msg_type: "link",
        requires_msg_id: true,
        build: build_link,
    },
    MessageSchema {
        msg_type: "event",
        requires_msg_id: false,
        build: build_event,
    },
];

static WECHAT_RULES: EnvelopeRules = EnvelopeRules {
    signature_field: MSG_SIGNATURE_FIELD,
    schemas: WECHAT_SCHEMAS,
    require_agent_id: false,
    allow_plaintext: true,
};

pub struct WeChatPlatform {
    config: WeChatInstanceConfig,
    crypto: Option<MessageCrypto>,
}

impl WeChatPlatform {
    pub fn from_config(config: &WeChatInstanceConfig) -> GatewayResult<Self> {
        let crypto = config
            .aes_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(MessageCrypto::new)
            .transpose()?;
        Ok(Self {
            config: config.clone(),
            crypto,
        })
    }
}

impl Platform for WeChatPlatform {
    const KIND: PlatformKind = PlatformKind::WeChat;

    fn id(&self) -> &str {
        &self.config.id
    }

    fn account_id(&self) -> &str {
        &self.config.appid
    }

    fn token(&self) -> &str {
        &self.config.token
    }

    fn crypto(&self) -> Option<&MessageCrypto> {
        self.crypto.as_ref()
    }

    fn deadline(&self) -> &DeadlineConfig {
        &self.config.deadline
    }

    fn rules(&self) -> &'static EnvelopeRules {
        &WECHAT_RULES
    }

    fn admin_user_ids(&self) -> &[String] {
        &self.config.admin_user_ids
    }

    fn honors_admin_grants(&self) -> bool {
        true
    }

    /// Plaintext handshake: `echostr` goes back verbatim once signed.
    fn handshake(&self, params: &HashMap<String, String>) -> GatewayResult<String> {
        let echostr = params
            .get("echostr")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| GatewayError::validation("missing echostr"))?;
        check_signature(params, SIGNATURE_FIELD, self.token(), None)?;
        Ok(echostr.clone())
    }

    fn fallback_key(&self, openai: &OpenAiConfig, is_admin: bool) -> Option<FallbackKey> {
        FallbackKey::guest(&self.config.guest_key)
            .or_else(|| FallbackKey::admin(&self.config.admin_key, is_admin))
            .or_else(|| FallbackKey::guest(&openai.guest_key))
            .or_else(|| FallbackKey::admin(&openai.admin_key, is_admin))
    }

    fn reply_agent_id<'a>(&self, _header: &'a InboundHeader) -> Option<&'a str> {
        None
    }

    fn parse_envelope(
        &self,
        xml: &str,
        params: &HashMap<String, String>,
    ) -> GatewayResult<ParsedEnvelope> {
        check_signature(params, SIGNATURE_FIELD, self.token(), None)?;
        envelope::parse_envelope(
            xml,
            params,
            self.account_id(),
            self.token(),
            self.crypto(),
            self.rules(),
        )
    }
}
