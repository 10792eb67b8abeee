use super::envelope::InboundHeader;
use crate::error::GatewayResult;
use crate::security::{compute_signature, MessageCrypto};

/// Wraps `value` in a CDATA section, splitting any embedded terminator.
pub fn cdata(value: &str) -> String {
    format!("<![CDATA[{}]]>", value.replace("]]>", "]]]]><![CDATA[>"))
}

/// Plaintext passive text reply addressed back to the sender of `header`.
///
/// `agent_id` is echoed for WeCom applications and omitted for WeChat.
pub fn build_text_reply(
    header: &InboundHeader,
    content: &str,
    create_time: i64,
    agent_id: Option<&str>,
) -> String {
    let mut xml = String::with_capacity(content.len() + 256);
    xml.push_str("<xml>");
    xml.push_str(&format!("<ToUserName>{}</ToUserName>", cdata(&header.from_user)));
    xml.push_str(&format!("<FromUserName>{}</FromUserName>", cdata(&header.to_user)));
    xml.push_str(&format!("<CreateTime>{create_time}</CreateTime>"));
    xml.push_str(&format!("<MsgType>{}</MsgType>", cdata("text")));
    xml.push_str(&format!("<Content>{}</Content>", cdata(content)));
    if let Some(agent_id) = agent_id {
        xml.push_str(&format!("<AgentID>{}</AgentID>", cdata(agent_id)));
    }
    xml.push_str("</xml>");
    xml
}

/// Encrypts a plaintext reply and wraps it in the signed outer envelope.
pub fn build_encrypted_reply(
    crypto: &MessageCrypto,
    plain_xml: &str,
    account_id: &str,
    token: &str,
    timestamp: i64,
    nonce: &str,
) -> GatewayResult<String> {
    let encrypt = crypto.encrypt(plain_xml.as_bytes(), account_id)?;
    let timestamp = timestamp.to_string();
    let signature = compute_signature(&[&encrypt, &timestamp, nonce, token]);

    Ok(format!(
        "<xml><Encrypt>{}</Encrypt><MsgSignature>{}</MsgSignature>\
         <TimeStamp>{timestamp}</TimeStamp><Nonce>{}</Nonce></xml>",
        cdata(&encrypt),
        cdata(&signature),
        cdata(nonce),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::envelope::parse_fields;

    fn header() -> InboundHeader {
        InboundHeader {
            to_user: "gh_account".into(),
            from_user: "openid-1".into(),
            create_time: 1,
            msg_id: Some("7".into()),
            agent_id: None,
        }
    }

    #[test]
    fn text_reply_swaps_sender_and_recipient() {
        let xml = build_text_reply(&header(), "回答 ]]> done", 1_700_000_123, None);
        let fields = parse_fields(&xml).unwrap();
        assert_eq!(fields.get("ToUserName"), Some("openid-1"));
        assert_eq!(fields.get("FromUserName"), Some("gh_account"));
        assert_eq!(fields.get("CreateTime"), Some("1700000123"));
        assert_eq!(fields.get("MsgType"), Some("text"));
        assert_eq!(fields.get("Content"), Some("回答 ]]> done"));
        assert_eq!(fields.get("AgentID"), None);
    }

    #[test]
    fn text_reply_can_carry_agent_id() {
        let xml = build_text_reply(&header(), "hi", 1, Some("1000002"));
        assert_eq!(parse_fields(&xml).unwrap().get("AgentID"), Some("1000002"));
    }

    #[test]
    fn encrypted_reply_is_signed_and_decryptable() {
        let crypto = MessageCrypto::new("abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG").unwrap();
        let plain = build_text_reply(&header(), "pong", 1, None);
        let xml = build_encrypted_reply(&crypto, &plain, "wx-app", "tok", 1_700_000_000, "12345")
            .unwrap();

        let fields = parse_fields(&xml).unwrap();
        let encrypt = fields.get("Encrypt").unwrap();
        assert_eq!(fields.get("TimeStamp"), Some("1700000000"));
        assert_eq!(fields.get("Nonce"), Some("12345"));
        assert_eq!(
            fields.get("MsgSignature"),
            Some(compute_signature(&["tok", "1700000000", "12345", encrypt]).as_str())
        );

        let payload = crypto.decrypt(encrypt).unwrap();
        assert_eq!(payload.account_id, "wx-app");
        assert_eq!(payload.plaintext_str().unwrap(), plain);
    }
}
