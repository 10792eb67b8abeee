use crate::error::{GatewayError, GatewayResult};
use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngExt;

/// Length of the EncodingAESKey as configured on the platform console.
pub const ENCODING_AES_KEY_LEN: usize = 43;

const BLOCK_PAD: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;

// The console generates keys whose last symbol carries non-zero trailing bits,
// which the canonical engine refuses.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Plaintext recovered from an `Encrypt` blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPayload {
    pub plaintext: Vec<u8>,
    /// Receiving account embedded after the message (appid or corpid).
    pub account_id: String,
}

impl DecryptedPayload {
    pub fn plaintext_str(&self) -> GatewayResult<&str> {
        std::str::from_utf8(&self.plaintext)
            .map_err(|_| GatewayError::decryption("decrypted payload is not utf-8"))
    }
}

/// AES-256-CBC codec for callback envelopes.
///
/// The IV is the first 16 key bytes for every operation. The platforms
/// require this; it is not a pattern to reuse elsewhere.
#[derive(Clone)]
pub struct MessageCrypto {
    key: [u8; 32],
}

impl std::fmt::Debug for MessageCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCrypto").finish_non_exhaustive()
    }
}

impl MessageCrypto {
    pub fn new(encoding_aes_key: &str) -> GatewayResult<Self> {
        let trimmed = encoding_aes_key.trim();
        if trimmed.len() != ENCODING_AES_KEY_LEN {
            return Err(GatewayError::configuration(format!(
                "EncodingAESKey must be {ENCODING_AES_KEY_LEN} characters, got {}",
                trimmed.len()
            )));
        }

        let raw = KEY_ENGINE
            .decode(format!("{trimmed}="))
            .map_err(|err| GatewayError::configuration(format!("invalid EncodingAESKey: {err}")))?;
        let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            GatewayError::configuration(format!(
                "EncodingAESKey decodes to {} bytes, expected 32",
                raw.len()
            ))
        })?;

        Ok(Self { key })
    }

    fn iv(&self) -> &[u8] {
        &self.key[..16]
    }

    /// Encrypts `plaintext` for `account_id` and returns base64 ciphertext.
    pub fn encrypt(&self, plaintext: &[u8], account_id: &str) -> GatewayResult<String> {
        let msg_len = u32::try_from(plaintext.len())
            .map_err(|_| GatewayError::validation("plaintext payload too large"))?;

        let mut raw = Vec::with_capacity(
            RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN + plaintext.len() + account_id.len() + BLOCK_PAD,
        );
        raw.extend_from_slice(random_ascii_token(RANDOM_PREFIX_LEN).as_bytes());
        raw.extend_from_slice(&msg_len.to_be_bytes());
        raw.extend_from_slice(plaintext);
        raw.extend_from_slice(account_id.as_bytes());

        // Aligned input still gets a whole block of padding.
        let pad_len = BLOCK_PAD - (raw.len() % BLOCK_PAD);
        raw.extend(std::iter::repeat_n(pad_len as u8, pad_len));

        let len = raw.len();
        let encrypted = cbc::Encryptor::<Aes256>::new((&self.key).into(), self.iv().into())
            .encrypt_padded_mut::<NoPadding>(&mut raw, len)
            .map_err(|_| GatewayError::decryption("failed to encrypt payload"))?;
        Ok(STANDARD.encode(encrypted))
    }

    /// Decrypts a base64 `Encrypt` blob.
    ///
    /// A trailing pad byte outside `1..=32` is treated as "no padding".
    pub fn decrypt(&self, ciphertext_b64: &str) -> GatewayResult<DecryptedPayload> {
        let mut buf = STANDARD
            .decode(ciphertext_b64.trim())
            .map_err(|err| GatewayError::decryption(format!("invalid base64 ciphertext: {err}")))?;
        if buf.is_empty() {
            return Err(GatewayError::decryption("empty ciphertext"));
        }

        let plain = cbc::Decryptor::<Aes256>::new((&self.key).into(), self.iv().into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| GatewayError::decryption("ciphertext is not block aligned"))?;

        let pad = match plain.last() {
            Some(&last) if (1..=BLOCK_PAD as u8).contains(&last) => last as usize,
            _ => 0,
        };
        let end = plain
            .len()
            .checked_sub(pad)
            .filter(|end| *end >= RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN)
            .ok_or_else(|| GatewayError::decryption("decrypted payload too short"))?;
        let content = &plain[RANDOM_PREFIX_LEN..end];

        let (len_bytes, rest) = content.split_at(LENGTH_FIELD_LEN);
        let msg_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if msg_len > rest.len() {
            return Err(GatewayError::decryption(
                "decrypted payload length field is out of range",
            ));
        }
        let (message, account) = rest.split_at(msg_len);
        let account_id = std::str::from_utf8(account)
            .map_err(|_| GatewayError::decryption("decrypted account id is not utf-8"))?
            .to_string();

        Ok(DecryptedPayload {
            plaintext: message.to_vec(),
            account_id,
        })
    }
}

pub(crate) fn random_ascii_token(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut out = String::with_capacity(len);
    let mut rng = rand::rng();
    for _ in 0..len {
        let idx = rng.random_range(0..CHARSET.len());
        out.push(CHARSET[idx] as char);
    }
    out
}

/// Numeric nonce for outbound encrypted replies.
pub(crate) fn random_nonce() -> String {
    let mut rng = rand::rng();
    rng.random_range(1_000_000_000u64..10_000_000_000u64).to_string()
}
