use crate::error::{GatewayError, GatewayResult};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// Query field carrying the plaintext-mode signature.
pub const SIGNATURE_FIELD: &str = "signature";
/// Query field carrying the signature in encrypted mode.
pub const MSG_SIGNATURE_FIELD: &str = "msg_signature";

/// SHA-1 hex digest over the lexicographically sorted concatenation of `parts`.
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();

    let mut sha = Sha1::new();
    sha.update(sorted.concat());
    hex::encode(sha.finalize())
}

/// Verifies a callback signature taken from the request parameters.
///
/// `signature_field` names the parameter holding the digest; `timestamp` and
/// `nonce` are always required. The digest covers `{token, timestamp, nonce}`
/// plus `extra` (the encrypted blob) when present.
pub fn check_signature(
    params: &HashMap<String, String>,
    signature_field: &str,
    token: &str,
    extra: Option<&str>,
) -> GatewayResult<()> {
    let signature = required_param(params, signature_field)?;
    let timestamp = required_param(params, "timestamp")?;
    let nonce = required_param(params, "nonce")?;

    let mut parts = vec![token, timestamp, nonce];
    if let Some(extra) = extra {
        parts.push(extra);
    }

    let expected = compute_signature(&parts);
    if expected.eq_ignore_ascii_case(signature.trim()) {
        Ok(())
    } else {
        tracing::debug!(
            field = signature_field,
            "callback signature mismatch (got {signature}, expected {expected})"
        );
        Err(GatewayError::Auth)
    }
}

fn required_param<'a>(params: &'a HashMap<String, String>, key: &str) -> GatewayResult<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GatewayError::validation(format!("missing query parameter `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn digest_matches_sorted_sha1() {
        let mut sha = Sha1::new();
        sha.update("1700000000nonce123token123");
        let expected = hex::encode(sha.finalize());

        assert_eq!(
            compute_signature(&["token123", "nonce123", "1700000000"]),
            expected
        );
    }

    #[test]
    fn valid_signature_passes_with_and_without_extra() {
        let sig = compute_signature(&["tok", "1700000000", "n1"]);
        let query = params(&[("signature", sig.as_str()), ("timestamp", "1700000000"), ("nonce", "n1")]);
        assert!(check_signature(&query, SIGNATURE_FIELD, "tok", None).is_ok());

        let sig = compute_signature(&["tok", "1700000000", "n1", "blob"]);
        let query = params(&[
            ("msg_signature", sig.as_str()),
            ("timestamp", "1700000000"),
            ("nonce", "n1"),
        ]);
        assert!(check_signature(&query, MSG_SIGNATURE_FIELD, "tok", Some("blob")).is_ok());
    }

    #[test]
    fn mutating_any_field_breaks_verification() {
        let sig = compute_signature(&["tok", "1700000000", "n1", "blob"]);
        let base = [
            ("msg_signature", sig.as_str()),
            ("timestamp", "1700000000"),
            ("nonce", "n1"),
        ];

        let mut ts = base;
        ts[1].1 = "1700000001";
        let mut nonce = base;
        nonce[2].1 = "n2";

        for query in [params(&ts), params(&nonce)] {
            assert!(matches!(
                check_signature(&query, MSG_SIGNATURE_FIELD, "tok", Some("blob")),
                Err(GatewayError::Auth)
            ));
        }

        let query = params(&base);
        assert!(check_signature(&query, MSG_SIGNATURE_FIELD, "other", Some("blob")).is_err());
        assert!(check_signature(&query, MSG_SIGNATURE_FIELD, "tok", Some("blob2")).is_err());
        assert!(check_signature(&query, MSG_SIGNATURE_FIELD, "tok", None).is_err());
    }

    #[test]
    fn missing_parameter_is_validation_error() {
        let query = params(&[("signature", "abc"), ("timestamp", "1")]);
        assert!(matches!(
            check_signature(&query, SIGNATURE_FIELD, "tok", None),
            Err(GatewayError::Validation(_))
        ));

        let query = params(&[("signature", "abc"), ("timestamp", "1"), ("nonce", "")]);
        assert!(matches!(
            check_signature(&query, SIGNATURE_FIELD, "tok", None),
            Err(GatewayError::Validation(_))
        ));
    }
}
