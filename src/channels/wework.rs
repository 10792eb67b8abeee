//! WeCom (企业微信) self-built application callbacks. Always encrypted.

use super::envelope::{
    build_event, build_image, build_link, build_location, build_text, build_video, build_voice,
    EnvelopeRules, InboundHeader, MessageSchema,
};
use super::{FallbackKey, Platform, PlatformKind};
use crate::config::{DeadlineConfig, OpenAiConfig, WeWorkInstanceConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::security::{check_signature, MessageCrypto, MSG_SIGNATURE_FIELD};
use std::collections::HashMap;

static WEWORK_SCHEMAS: &[MessageSchema] = &[
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

static WEWORK_RULES: EnvelopeRules = EnvelopeRules {
    signature_field: MSG_SIGNATURE_FIELD,
    schemas: WEWORK_SCHEMAS,
    require_agent_id: true,
    allow_plaintext: false,
};

pub struct WeWorkPlatform {
    config: WeWorkInstanceConfig,
    crypto: MessageCrypto,
}

impl WeWorkPlatform {
    pub fn from_config(config: &WeWorkInstanceConfig) -> GatewayResult<Self> {
        Ok(Self {
            crypto: MessageCrypto::new(&config.aes_key)?,
            config: config.clone(),
        })
    }
}

impl Platform for WeWorkPlatform {
    const KIND: PlatformKind = PlatformKind::WeWork;

    fn id(&self) -> &str {
        &self.config.id
    }

    fn account_id(&self) -> &str {
        &self.config.corp_id
    }

    fn token(&self) -> &str {
        &self.config.token
    }

    fn crypto(&self) -> Option<&MessageCrypto> {
        Some(&self.crypto)
    }

    fn deadline(&self) -> &DeadlineConfig {
        &self.config.deadline
    }

    fn rules(&self) -> &'static EnvelopeRules {
        &WEWORK_RULES
    }

    fn admin_user_ids(&self) -> &[String] {
        &self.config.admin_user_ids
    }

    fn honors_admin_grants(&self) -> bool {
        false
    }

    /// `echostr` is ciphertext here; the decrypted text is the answer.
    fn handshake(&self, params: &HashMap<String, String>) -> GatewayResult<String> {
        let echostr = params
            .get("echostr")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| GatewayError::validation("missing echostr"))?;
        check_signature(params, MSG_SIGNATURE_FIELD, self.token(), Some(echostr))?;

        let payload = self.crypto.decrypt(echostr)?;
        if payload.account_id != self.config.corp_id {
            return Err(GatewayError::AccountMismatch {
                expected: self.config.corp_id.clone(),
                actual: payload.account_id,
            });
        }
        Ok(payload.plaintext_str()?.to_string())
    }

    fn fallback_key(&self, openai: &OpenAiConfig, is_admin: bool) -> Option<FallbackKey> {
        FallbackKey::guest(&openai.guest_key)
            .or_else(|| FallbackKey::admin(&openai.admin_key, is_admin))
    }

    fn reply_agent_id<'a>(&self, header: &'a InboundHeader) -> Option<&'a str> {
        header.agent_id.as_deref()
    }
}
