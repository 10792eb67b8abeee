//! Typed records kept in the key-value store between deliveries.

use super::KvStore;
use crate::agent::history::HistoryTurn;
use crate::error::{GatewayError, GatewayResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const KEY_NAMESPACE: &str = "openai";
const ONE_DAY: Duration = Duration::from_secs(24 * 3600);

/// Redelivery counter for one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub count: u32,
    /// Unix ms of the first delivery; budgets are measured from here.
    pub first_seen_ms: i64,
}

/// Last prompt or answer of a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurnRecord {
    pub msg_id: String,
    pub conversation_id: String,
    pub content: String,
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxTtl {
    pub attempt: Duration,
    pub answer: Duration,
    /// Pending-question pointer and last prompt/answer.
    pub conversation: Duration,
    /// Bound API keys and chat type.
    pub settings: Duration,
    /// Settings are rewritten when less than this is left.
    pub refresh_threshold: Duration,
}

impl Default for MailboxTtl {
    fn default() -> Self {
        Self {
            attempt: Duration::from_secs(300),
            answer: Duration::from_secs(300),
            conversation: ONE_DAY,
            settings: ONE_DAY * 30,
            refresh_threshold: ONE_DAY,
        }
    }
}

/// Identifies one sender on one receiving account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub platform: &'static str,
    pub account_id: String,
    pub user_id: String,
}

impl UserKey {
    pub fn new(platform: &'static str, account_id: &str, user_id: &str) -> Self {
        Self {
            platform,
            account_id: account_id.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// `openai:<record>:<platform>:<account>:<user>`
    pub fn key(&self, record: &str) -> String {
        format!(
            "{KEY_NAMESPACE}:{record}:{}:{}:{}",
            self.platform, self.account_id, self.user_id
        )
    }

    pub fn key_with(&self, record: &str, extra: &str) -> String {
        format!("{}:{extra}", self.key(record))
    }
}

/// Typed view over the shared [`KvStore`].
#[derive(Clone)]
pub struct Mailbox {
    store: Arc<dyn KvStore>,
    ttl: MailboxTtl,
}

impl Mailbox {
    pub fn new(store: Arc<dyn KvStore>, ttl: MailboxTtl) -> Self {
        Self { store, ttl }
    }

    async fn get_string(&self, key: &str) -> GatewayResult<Option<String>> {
        self.store.get(key).await.map_err(GatewayError::storage)
    }

    async fn put_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        self.store
            .set(key, value, ttl)
            .await
            .map_err(GatewayError::storage)
    }

    async fn remove(&self, key: &str) -> GatewayResult<()> {
        self.store.delete(key).await.map_err(GatewayError::storage)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> GatewayResult<Option<T>> {
        let Some(raw) = self.get_string(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!("dropping unreadable record {key}: {err}");
                Ok(None)
            }
        }
    }

    async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> GatewayResult<()> {
        let raw = serde_json::to_string(value).map_err(GatewayError::storage)?;
        self.put_string(key, &raw, ttl).await
    }

    pub async fn attempt(&self, user: &UserKey, msg_id: &str) -> GatewayResult<Option<AttemptRecord>> {
        self.get_json(&user.key_with("attempt", msg_id)).await
    }

    pub async fn put_attempt(
        &self,
        user: &UserKey,
        msg_id: &str,
        record: &AttemptRecord,
    ) -> GatewayResult<()> {
        self.put_json(&user.key_with("attempt", msg_id), record, Some(self.ttl.attempt))
            .await
    }

    pub async fn answer(&self, user: &UserKey, msg_id: &str) -> GatewayResult<Option<String>> {
        self.get_string(&user.key_with("answer", msg_id)).await
    }

    pub async fn put_answer(&self, user: &UserKey, msg_id: &str, answer: &str) -> GatewayResult<()> {
        self.put_string(&user.key_with("answer", msg_id), answer, Some(self.ttl.answer))
            .await
    }

    /// Newest message id still waiting for an answer.
    pub async fn delayed(&self, user: &UserKey) -> GatewayResult<Option<String>> {
        self.get_string(&user.key("delayed")).await
    }

    pub async fn put_delayed(&self, user: &UserKey, msg_id: &str) -> GatewayResult<()> {
        self.put_string(&user.key("delayed"), msg_id, Some(self.ttl.conversation))
            .await
    }

    pub async fn last_prompt(&self, user: &UserKey) -> GatewayResult<Option<ChatTurnRecord>> {
        self.get_json(&user.key("lastChatPrompt")).await
    }

    pub async fn put_last_prompt(&self, user: &UserKey, record: &ChatTurnRecord) -> GatewayResult<()> {
        self.put_json(&user.key("lastChatPrompt"), record, Some(self.ttl.conversation))
            .await
    }

    pub async fn delete_last_prompt(&self, user: &UserKey) -> GatewayResult<()> {
        self.remove(&user.key("lastChatPrompt")).await
    }

    pub async fn last_answer(&self, user: &UserKey) -> GatewayResult<Option<ChatTurnRecord>> {
        self.get_json(&user.key("lastChatAnswer")).await
    }

    pub async fn put_last_answer(&self, user: &UserKey, record: &ChatTurnRecord) -> GatewayResult<()> {
        self.put_json(&user.key("lastChatAnswer"), record, Some(self.ttl.conversation))
            .await
    }

    pub async fn delete_last_answer(&self, user: &UserKey) -> GatewayResult<()> {
        self.remove(&user.key("lastChatAnswer")).await
    }

    pub async fn history(
        &self,
        user: &UserKey,
        conversation_id: &str,
    ) -> GatewayResult<Vec<HistoryTurn>> {
        Ok(self
            .get_json(&user.key_with("history", conversation_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn put_history(
        &self,
        user: &UserKey,
        conversation_id: &str,
        turns: &[HistoryTurn],
    ) -> GatewayResult<()> {
        self.put_json(
            &user.key_with("history", conversation_id),
            &turns,
            Some(self.ttl.conversation),
        )
        .await
    }

    pub async fn api_key(&self, user: &UserKey) -> GatewayResult<Option<String>> {
        self.get_refreshed(&user.key("apiKey")).await
    }

    pub async fn put_api_key(&self, user: &UserKey, api_key: &str) -> GatewayResult<()> {
        self.put_string(&user.key("apiKey"), api_key, Some(self.ttl.settings))
            .await
    }

    pub async fn delete_api_key(&self, user: &UserKey) -> GatewayResult<()> {
        self.remove(&user.key("apiKey")).await
    }

    pub async fn chat_type(&self, user: &UserKey) -> GatewayResult<Option<String>> {
        self.get_refreshed(&user.key("chatType")).await
    }

    pub async fn put_chat_type(&self, user: &UserKey, chat_type: &str) -> GatewayResult<()> {
        self.put_string(&user.key("chatType"), chat_type, Some(self.ttl.settings))
            .await
    }

    /// Admins granted through `/adminAuth`, shared across platforms.
    pub async fn is_admin(&self, user_id: &str) -> GatewayResult<bool> {
        Ok(self
            .get_string(&format!("admin:{user_id}"))
            .await?
            .is_some())
    }

    pub async fn put_admin(&self, user_id: &str) -> GatewayResult<()> {
        self.put_string(&format!("admin:{user_id}"), "1", None).await
    }

    async fn get_refreshed(&self, key: &str) -> GatewayResult<Option<String>> {
        self.store
            .get_with_refresh(key, self.ttl.settings, self.ttl.refresh_threshold)
            .await
            .map_err(GatewayError::storage)
    }
}
