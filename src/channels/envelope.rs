//! Callback envelope parsing.
//!
//! Both platforms post an `<xml>` document whose direct children are the
//! message fields. Encrypted deliveries wrap the real document inside an
//! `Encrypt` field, which is verified, decrypted and parsed again.

use crate::error::{GatewayError, GatewayResult};
use crate::security::{check_signature, MessageCrypto};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

/// Field holding the encrypted blob in a wrapper envelope.
pub const ENCRYPT_FIELD: &str = "Encrypt";

// A decrypted document must itself be plaintext.
const MAX_ENVELOPE_DEPTH: usize = 2;

/// Flat view of the root element's children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeFields(HashMap<String, String>);

impl EnvelopeFields {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn require(&self, name: &str) -> GatewayResult<&str> {
        self.get(name)
            .ok_or_else(|| GatewayError::validation(format!("envelope field `{name}` is missing")))
    }

    fn require_f64(&self, name: &str) -> GatewayResult<f64> {
        self.require(name)?
            .trim()
            .parse()
            .map_err(|_| GatewayError::validation(format!("envelope field `{name}` is not numeric")))
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.get(name)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Parses an envelope document into its field map.
pub fn parse_fields(xml: &str) -> GatewayResult<EnvelopeFields> {
    if xml.trim().is_empty() {
        return Err(GatewayError::validation("empty envelope"));
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if path.is_empty() {
                    if name != "xml" || saw_root {
                        return Err(GatewayError::validation(format!(
                            "unexpected root element `{name}`"
                        )));
                    }
                    saw_root = true;
                } else if path.len() == 1 {
                    fields.entry(name.clone()).or_insert_with(String::new);
                }
                path.push(name);
            }
            Ok(Event::Empty(empty)) => {
                if path.len() == 1 {
                    let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                    fields.entry(name).or_insert_with(String::new);
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(text)) => {
                if path.len() == 2 {
                    let value = text
                        .unescape()
                        .map_err(|err| GatewayError::validation(format!("malformed xml text: {err}")))?;
                    append_field(&mut fields, &path[1], &value);
                }
            }
            Ok(Event::CData(cdata)) => {
                if path.len() == 2 {
                    let value = String::from_utf8_lossy(&cdata);
                    append_field(&mut fields, &path[1], &value);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(GatewayError::validation(format!(
                    "malformed xml at {}: {err}",
                    reader.buffer_position()
                )))
            }
            Ok(_) => {}
        }
    }

    if !saw_root || !path.is_empty() {
        return Err(GatewayError::validation("envelope has no complete <xml> root"));
    }
    if fields.is_empty() {
        return Err(GatewayError::validation("envelope has no fields"));
    }
    Ok(EnvelopeFields(fields))
}

fn append_field(fields: &mut HashMap<String, String>, name: &str, value: &str) {
    fields.entry(name.to_string()).or_default().push_str(value);
}

/// Fields shared by every inbound message and event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundHeader {
    /// Receiving account (original id for WeChat, corpid for WeCom).
    pub to_user: String,
    /// Sender openid / userid.
    pub from_user: String,
    pub create_time: i64,
    /// Always carried as a string; ids are 64-bit and must not round-trip through floats.
    pub msg_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    Text {
        content: String,
    },
    Voice {
        media_id: String,
        format: String,
        /// Speech recognition result when the account has it enabled.
        recognition: Option<String>,
    },
    Image {
        pic_url: String,
        media_id: String,
    },
    Video {
        media_id: String,
        thumb_media_id: String,
        short: bool,
    },
    Location {
        latitude: f64,
        longitude: f64,
        scale: f64,
        label: String,
    },
    Link {
        title: String,
        description: String,
        url: String,
    },
    Subscribe {
        event_key: Option<String>,
    },
    Unsubscribe,
    Event {
        event: String,
        event_key: Option<String>,
    },
}

impl TypedMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Voice { .. } => "voice",
            Self::Image { .. } => "image",
            Self::Video { short: false, .. } => "video",
            Self::Video { short: true, .. } => "shortvideo",
            Self::Location { .. } => "location",
            Self::Link { .. } => "link",
            Self::Subscribe { .. } | Self::Unsubscribe | Self::Event { .. } => "event",
        }
    }

    pub fn is_event(&self) -> bool {
        self.msg_type() == "event"
    }

    /// Text fed to the chat pipeline: text content or a voice transcript.
    pub fn chat_text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            Self::Voice {
                recognition: Some(text),
                ..
            } if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }
}

/// One entry of a platform's `MsgType` dispatch table.
pub struct MessageSchema {
    pub msg_type: &'static str,
    /// Events carry no `MsgId`.
    pub requires_msg_id: bool,
    pub build: fn(&EnvelopeFields) -> GatewayResult<TypedMessage>,
}

/// Per-platform knobs for [`parse_envelope`].
pub struct EnvelopeRules {
    pub signature_field: &'static str,
    pub schemas: &'static [MessageSchema],
    pub require_agent_id: bool,
    pub allow_plaintext: bool,
}

/// Result of parsing one callback body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEnvelope {
    pub header: InboundHeader,
    pub message: TypedMessage,
    pub is_encrypted: bool,
}

/// Validates and decodes a callback body.
///
/// The signature over the encrypted blob is checked before decryption, and
/// the account id recovered from the ciphertext must equal
/// `expected_account_id`.
pub fn parse_envelope(
    xml: &str,
    params: &HashMap<String, String>,
    expected_account_id: &str,
    token: &str,
    crypto: Option<&MessageCrypto>,
    rules: &EnvelopeRules,
) -> GatewayResult<ParsedEnvelope> {
    parse_at_depth(xml, params, expected_account_id, token, crypto, rules, 1)
}

fn parse_at_depth(
    xml: &str,
    params: &HashMap<String, String>,
    expected_account_id: &str,
    token: &str,
    crypto: Option<&MessageCrypto>,
    rules: &EnvelopeRules,
    depth: usize,
) -> GatewayResult<ParsedEnvelope> {
    let fields = parse_fields(xml)?;

    if let Some(blob) = fields.get(ENCRYPT_FIELD) {
        if depth >= MAX_ENVELOPE_DEPTH {
            return Err(GatewayError::validation("nested encrypted envelope"));
        }
        let crypto = crypto.ok_or_else(|| {
            GatewayError::configuration("encrypted envelope received but no EncodingAESKey is set")
        })?;

        check_signature(params, rules.signature_field, token, Some(blob))?;
        let payload = crypto.decrypt(blob)?;
        if payload.account_id != expected_account_id {
            return Err(GatewayError::AccountMismatch {
                expected: expected_account_id.to_string(),
                actual: payload.account_id,
            });
        }

        let inner = payload.plaintext_str()?;
        let mut parsed = parse_at_depth(
            inner,
            params,
            expected_account_id,
            token,
            Some(crypto),
            rules,
            depth + 1,
        )?;
        parsed.is_encrypted = true;
        return Ok(parsed);
    }

    // Only the outermost layer counts; decrypted payloads are plaintext XML.
    if depth == 1 && !rules.allow_plaintext {
        return Err(GatewayError::validation(
            "plaintext envelope not accepted on this platform",
        ));
    }

    let msg_type = fields
        .get("MsgType")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GatewayError::validation("envelope has no MsgType"))?;
    let schema = rules
        .schemas
        .iter()
        .find(|schema| schema.msg_type == msg_type)
        .ok_or_else(|| GatewayError::validation(format!("unsupported MsgType `{msg_type}`")))?;

    let header = parse_header(&fields, schema.requires_msg_id, rules.require_agent_id)?;
    let message = (schema.build)(&fields)?;

    Ok(ParsedEnvelope {
        header,
        message,
        is_encrypted: false,
    })
}

fn parse_header(
    fields: &EnvelopeFields,
    requires_msg_id: bool,
    require_agent_id: bool,
) -> GatewayResult<InboundHeader> {
    let create_time = fields
        .require("CreateTime")?
        .trim()
        .parse::<i64>()
        .map_err(|_| GatewayError::validation("CreateTime is not an integer"))?;

    let msg_id = fields.optional("MsgId").map(|id| id.trim().to_string());
    if requires_msg_id && msg_id.is_none() {
        return Err(GatewayError::validation("message has no MsgId"));
    }

    let agent_id = fields.optional("AgentID");
    if require_agent_id && agent_id.is_none() {
        return Err(GatewayError::validation("message has no AgentID"));
    }

    Ok(InboundHeader {
        to_user: fields.require("ToUserName")?.to_string(),
        from_user: fields.require("FromUserName")?.to_string(),
        create_time,
        msg_id,
        agent_id,
    })
}

pub(crate) fn build_text(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Text {
        content: fields.require("Content")?.to_string(),
    })
}

pub(crate) fn build_voice(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Voice {
        media_id: fields.require("MediaId")?.to_string(),
        format: fields.require("Format")?.to_string(),
        recognition: fields.optional("Recognition"),
    })
}

pub(crate) fn build_image(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Image {
        pic_url: fields.require("PicUrl")?.to_string(),
        media_id: fields.require("MediaId")?.to_string(),
    })
}

pub(crate) fn build_video(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Video {
        media_id: fields.require("MediaId")?.to_string(),
        thumb_media_id: fields.require("ThumbMediaId")?.to_string(),
        short: false,
    })
}

pub(crate) fn build_short_video(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Video {
        media_id: fields.require("MediaId")?.to_string(),
        thumb_media_id: fields.require("ThumbMediaId")?.to_string(),
        short: true,
    })
}

pub(crate) fn build_location(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Location {
        latitude: fields.require_f64("Location_X")?,
        longitude: fields.require_f64("Location_Y")?,
        scale: fields.require_f64("Scale")?,
        label: fields.require("Label")?.to_string(),
    })
}

pub(crate) fn build_link(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    Ok(TypedMessage::Link {
        title: fields.require("Title")?.to_string(),
        description: fields.require("Description")?.to_string(),
        url: fields.require("Url")?.to_string(),
    })
}

pub(crate) fn build_event(fields: &EnvelopeFields) -> GatewayResult<TypedMessage> {
    let event = fields.require("Event")?.trim().to_string();
    let event_key = fields.optional("EventKey");
    Ok(match event.as_str() {
        "subscribe" => TypedMessage::Subscribe { event_key },
        "unsubscribe" => TypedMessage::Unsubscribe,
        _ => TypedMessage::Event { event, event_key },
    })
}
