use axum::http::StatusCode;

/// Failures surfaced by the callback pipeline.
///
/// Every variant resolves to a fixed user-facing sentence through
/// [`GatewayError::user_message`]; the `Display` text is for logs only.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("signature mismatch")]
    Auth,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("account id mismatch: expected {expected}, got {actual}")]
    AccountMismatch { expected: String, actual: String },

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("unknown platform instance: {0}")]
    UnknownInstance(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wraps a backend failure from the key-value store.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }

    /// HTTP status returned to the platform.
    ///
    /// The callback platforms treat every non-200 reply alike, so request
    /// problems all share 400 and only server-side faults use 5xx.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::Auth
            | Self::AccountMismatch { .. }
            | Self::UnknownPlatform(_)
            | Self::UnknownInstance(_)
            | Self::Decryption(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Natural-language text that may cross the protocol boundary.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "提交的数据不合法",
            Self::Auth => "签名不合法",
            Self::Decryption(_) => "解密消息失败",
            Self::AccountMismatch { .. } => "appid 不符",
            Self::UnknownPlatform(_) => "平台不合法",
            Self::UnknownInstance(_) => "平台ID不合法",
            Self::Upstream(_) => "OpenAI 服务异常，请稍后重试",
            Self::Configuration(_) | Self::Storage(_) => "服务异常，请稍后重试",
        }
    }

    /// Short machine label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Auth => "auth",
            Self::Decryption(_) => "decryption",
            Self::Configuration(_) => "configuration",
            Self::AccountMismatch { .. } => "account_mismatch",
            Self::UnknownPlatform(_) => "unknown_platform",
            Self::UnknownInstance(_) => "unknown_instance",
            Self::Upstream(_) => "upstream",
            Self::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_faults_map_to_bad_request() {
        assert_eq!(GatewayError::Auth.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::validation("missing nonce").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::storage("disk full").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn user_message_hides_details() {
        let err = GatewayError::AccountMismatch {
            expected: "wx-expected".into(),
            actual: "wx-attacker".into(),
        };
        assert!(!err.user_message().contains("wx-attacker"));
        assert!(err.to_string().contains("wx-attacker"));
        assert_eq!(err.kind(), "account_mismatch");
    }
}
