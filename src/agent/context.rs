use crate::channels::PlatformKind;
use crate::security::RoleSet;
use crate::store::UserKey;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Conversation mode chosen with `/setChatType`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatType {
    /// Every question stands alone.
    #[default]
    Single,
    /// Questions carry the trimmed conversation history.
    Multi,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "单聊",
            Self::Multi => "串聊",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "单聊" => Some(Self::Single),
            "串聊" => Some(Self::Multi),
            _ => None,
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message that reached the orchestrator during this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChat {
    pub user: UserKey,
    pub msg_id: String,
    pub attempt: u32,
}

/// Per-request values threaded through the pipeline instead of globals.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub platform: PlatformKind,
    pub instance_id: String,
    pub started_at: Instant,
    pending: Arc<Mutex<Option<PendingChat>>>,
}

impl RequestContext {
    pub fn new(platform: PlatformKind, instance_id: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            platform,
            instance_id: instance_id.to_string(),
            started_at: Instant::now(),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            platform = %self.platform,
            instance = %self.instance_id,
        )
    }

    /// Recorded by the orchestrator once the attempt counter is known, so the
    /// deadline handler can pick the right acknowledgement.
    pub fn mark_pending(&self, chat: PendingChat) {
        *self.pending.lock() = Some(chat);
    }

    pub fn pending(&self) -> Option<PendingChat> {
        self.pending.lock().clone()
    }
}

/// Who is asking and which key pays for it.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub key: UserKey,
    /// Empty when neither the user nor any fallback provides a key.
    pub api_key: String,
    pub roles: RoleSet,
    pub chat_type: ChatType,
}

impl UserContext {
    pub fn new(key: UserKey) -> Self {
        Self {
            key,
            api_key: String::new(),
            roles: RoleSet::guest(),
            chat_type: ChatType::Single,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.key.user_id
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}
