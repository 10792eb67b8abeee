//! Reconciles the platform's short reply deadline with slow upstream calls.
//!
//! Every delivery of a message id goes through [`ReplyOrchestrator::deliver`].
//! The first delivery starts the upstream call on its own task; redeliveries
//! only wait for it. The key-value store is the mailbox between deliveries,
//! so a redelivery that lands on another process still finds the answer.

use super::context::{ChatType, PendingChat, RequestContext};
use super::history::{HistoryAssembler, HistoryBudget, HistoryTurn};
use crate::channels::Platform;
use crate::config::OpenAiConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{ChatCompletion, ChatMessage, ChatProvider};
use crate::store::{unix_millis_now, AttemptRecord, ChatTurnRecord, Mailbox, UserKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::Instrument;

/// Acknowledgement for attempts the platform will redeliver on its own.
pub const PROCESSING_ACK: &str = "正在处理中";
pub const SERVICE_BUSY: &str = "服务异常，请稍后重试";
const UPSTREAM_TIMEOUT_MESSAGE: &str = "请求 OpenAI 超时";

/// Attempts answered with [`PROCESSING_ACK`] when the deadline fires.
const ACK_ATTEMPTS: u32 = 2;
/// Used when the answer is being produced by another process.
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Tells the user how to fetch an answer that missed every delivery.
pub fn retry_instruction(msg_id: &str) -> String {
    format!("正在处理中，请稍后用\n/retry {msg_id}\n命令获取回答")
}

/// What the HTTP response should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Literal `success`: nothing to say to the user.
    Success,
}

/// One question headed upstream.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user: UserKey,
    pub msg_id: String,
    pub content: String,
    pub token_count: usize,
    pub api_key: String,
    pub chat_type: ChatType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Answered(String),
    /// Still running once this delivery's budget ran out.
    Pending { msg_id: String, attempt: u32 },
}

impl DeliveryOutcome {
    pub fn into_reply(self) -> String {
        match self {
            Self::Answered(answer) => answer,
            Self::Pending { msg_id, .. } => retry_instruction(&msg_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub upstream_timeout: Duration,
    pub history: HistoryBudget,
    pub system_init_message: String,
}

impl OrchestratorSettings {
    pub fn from_config(openai: &OpenAiConfig) -> Self {
        Self {
            upstream_timeout: Duration::from_millis(openai.timeout_ms),
            history: HistoryBudget {
                max_tokens: openai.max_chat_tokens,
                min_response_tokens: openai.min_response_tokens,
                max_turns: openai.max_history_turns,
            },
            system_init_message: openai.system_init_message.clone(),
        }
    }
}

type AnswerReceiver = watch::Receiver<Option<String>>;

pub struct ReplyOrchestrator<P: Platform> {
    platform: Arc<P>,
    mailbox: Mailbox,
    provider: Arc<dyn ChatProvider>,
    settings: Arc<OrchestratorSettings>,
    /// Upstream tasks started by this process, keyed by answer key.
    inflight: Arc<Mutex<HashMap<String, AnswerReceiver>>>,
}

impl<P: Platform> Clone for ReplyOrchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            mailbox: self.mailbox.clone(),
            provider: Arc::clone(&self.provider),
            settings: Arc::clone(&self.settings),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<P: Platform> ReplyOrchestrator<P> {
    pub fn new(
        platform: Arc<P>,
        mailbox: Mailbox,
        provider: Arc<dyn ChatProvider>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            platform,
            mailbox,
            provider,
            settings: Arc::new(settings),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn provider(&self) -> &Arc<dyn ChatProvider> {
        &self.provider
    }

    /// Handles one delivery of `chat.msg_id`.
    ///
    /// The attempt record is the only dispatch gate. Reading and bumping it
    /// is not atomic, so two truly concurrent first deliveries may both call
    /// upstream; both then write the same answer record.
    pub async fn deliver(
        &self,
        ctx: &RequestContext,
        chat: ChatRequest,
    ) -> GatewayResult<DeliveryOutcome> {
        let deadline = *self.platform.deadline();
        let now_ms = unix_millis_now();

        let Some(previous) = self.mailbox.attempt(&chat.user, &chat.msg_id).await? else {
            let record = AttemptRecord {
                count: 1,
                first_seen_ms: now_ms,
            };
            self.mailbox
                .put_attempt(&chat.user, &chat.msg_id, &record)
                .await?;
            self.mark_pending(ctx, &chat, record.count);

            tracing::info!(msg_id = %chat.msg_id, chat_type = %chat.chat_type, "dispatching upstream");
            let receiver = self.dispatch_upstream(ctx, chat.clone());
            let budget = deadline.remaining_budget(Duration::ZERO);
            return self.await_answer(chat, Some(receiver), budget, record.count).await;
        };

        let record = AttemptRecord {
            count: previous.count.saturating_add(1),
            first_seen_ms: previous.first_seen_ms,
        };
        self.mailbox
            .put_attempt(&chat.user, &chat.msg_id, &record)
            .await?;
        self.mark_pending(ctx, &chat, record.count);
        tracing::info!(msg_id = %chat.msg_id, attempt = record.count, "redelivery");

        if let Some(answer) = self.mailbox.answer(&chat.user, &chat.msg_id).await? {
            tracing::debug!(msg_id = %chat.msg_id, "answer already cached");
            return Ok(DeliveryOutcome::Answered(answer));
        }

        let elapsed = Duration::from_millis(now_ms.saturating_sub(record.first_seen_ms).max(0) as u64);
        let budget = deadline.remaining_budget(elapsed);
        let receiver = self
            .inflight
            .lock()
            .get(&answer_slot(&chat.user, &chat.msg_id))
            .cloned();
        self.await_answer(chat, receiver, budget, record.count).await
    }

    /// Races `work` against the platform's response deadline.
    ///
    /// `work` runs on its own task and keeps running when the deadline wins.
    /// Early attempts are stalled by the slack delay and acknowledged; later
    /// ones get the retry instruction.
    pub async fn respond<F>(&self, ctx: &RequestContext, work: F) -> Reply
    where
        F: Future<Output = Reply> + Send + 'static,
    {
        let deadline = *self.platform.deadline();
        let mut handle = tokio::spawn(work.in_current_span());

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::error!("reply task failed: {err}");
                    Reply::Text(SERVICE_BUSY.to_string())
                }
            },
            () = time::sleep(deadline.response_deadline()) => {
                let Some(pending) = ctx.pending() else {
                    tracing::warn!("response deadline hit before reaching upstream");
                    return Reply::Text(SERVICE_BUSY.to_string());
                };
                if pending.attempt <= ACK_ATTEMPTS {
                    tracing::info!(msg_id = %pending.msg_id, attempt = pending.attempt, "deadline hit, stalling for redelivery");
                    time::sleep(deadline.slack_delay()).await;
                    return Reply::Text(PROCESSING_ACK.to_string());
                }
                if let Err(err) = self.mailbox.put_delayed(&pending.user, &pending.msg_id).await {
                    tracing::warn!("failed to record delayed message: {err}");
                }
                Reply::Text(retry_instruction(&pending.msg_id))
            }
        }
    }

    fn mark_pending(&self, ctx: &RequestContext, chat: &ChatRequest, attempt: u32) {
        ctx.mark_pending(PendingChat {
            user: chat.user.clone(),
            msg_id: chat.msg_id.clone(),
            attempt,
        });
    }

    fn dispatch_upstream(&self, ctx: &RequestContext, chat: ChatRequest) -> AnswerReceiver {
        let (sender, receiver) = watch::channel(None);
        let slot = answer_slot(&chat.user, &chat.msg_id);
        self.inflight.lock().insert(slot.clone(), receiver.clone());

        let job = UpstreamJob {
            mailbox: self.mailbox.clone(),
            provider: Arc::clone(&self.provider),
            settings: Arc::clone(&self.settings),
            conversation_seed: ctx.request_id.clone(),
        };
        let slot = InflightSlot {
            inflight: Arc::clone(&self.inflight),
            slot,
        };

        tokio::spawn(
            async move {
                let _slot = slot;
                let answer = job.run(&chat).await;
                if let Err(err) = job
                    .mailbox
                    .put_answer(&chat.user, &chat.msg_id, &answer)
                    .await
                {
                    tracing::error!(msg_id = %chat.msg_id, "failed to store answer: {err}");
                }
                let _ = sender.send(Some(answer));
            }
            .in_current_span(),
        );
        receiver
    }

    async fn await_answer(
        &self,
        chat: ChatRequest,
        receiver: Option<AnswerReceiver>,
        budget: Duration,
        attempt: u32,
    ) -> GatewayResult<DeliveryOutcome> {
        let waited = time::timeout(
            budget,
            self.wait_for_answer(&chat.user, &chat.msg_id, receiver),
        )
        .await;

        match waited {
            Ok(Ok(Some(answer))) => Ok(DeliveryOutcome::Answered(answer)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(None)) | Err(_) => {
                tracing::info!(msg_id = %chat.msg_id, attempt, "answer not ready within budget");
                self.mailbox.put_delayed(&chat.user, &chat.msg_id).await?;
                Ok(DeliveryOutcome::Pending {
                    msg_id: chat.msg_id,
                    attempt,
                })
            }
        }
    }

    async fn wait_for_answer(
        &self,
        user: &UserKey,
        msg_id: &str,
        receiver: Option<AnswerReceiver>,
    ) -> GatewayResult<Option<String>> {
        if let Some(mut receiver) = receiver {
            let published = receiver
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|answer| answer.clone());
            if published.is_some() {
                return Ok(published);
            }
            // The task went away without publishing; fall back to the store.
            return self.mailbox.answer(user, msg_id).await;
        }

        loop {
            if let Some(answer) = self.mailbox.answer(user, msg_id).await? {
                return Ok(Some(answer));
            }
            time::sleep(STORE_POLL_INTERVAL).await;
        }
    }
}

fn answer_slot(user: &UserKey, msg_id: &str) -> String {
    user.key_with("answer", msg_id)
}

/// Releases an in-process answer slot when its upstream task ends, panics included.
struct InflightSlot {
    inflight: Arc<Mutex<HashMap<String, AnswerReceiver>>>,
    slot: String,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.slot);
    }
}

/// Everything the detached upstream task owns.
struct UpstreamJob {
    mailbox: Mailbox,
    provider: Arc<dyn ChatProvider>,
    settings: Arc<OrchestratorSettings>,
    /// Conversation id for a multi-turn chat that has none yet.
    conversation_seed: String,
}

impl UpstreamJob {
    /// Produces the answer text. Failures become the answer.
    async fn run(&self, chat: &ChatRequest) -> String {
        let result = match chat.chat_type {
            ChatType::Single => self.run_single(chat).await,
            ChatType::Multi => self.run_multi_turn(chat).await,
        };
        result.unwrap_or_else(|err| {
            tracing::warn!(msg_id = %chat.msg_id, kind = err.kind(), "upstream failed: {err}");
            match err {
                GatewayError::Upstream(message) => message,
                other => other.user_message().to_string(),
            }
        })
    }

    async fn run_single(&self, chat: &ChatRequest) -> GatewayResult<String> {
        let messages = [
            ChatMessage::system(self.settings.system_init_message.clone()),
            ChatMessage::user(chat.content.clone()),
        ];
        Ok(self.complete(&chat.api_key, &messages).await?.reply_text())
    }

    async fn run_multi_turn(&self, chat: &ChatRequest) -> GatewayResult<String> {
        let user = &chat.user;
        let last_prompt = self.mailbox.last_prompt(user).await?;
        let last_answer = self.mailbox.last_answer(user).await?;

        let conversation_id = last_prompt
            .as_ref()
            .map(|prompt| prompt.conversation_id.clone())
            .unwrap_or_else(|| self.conversation_seed.clone());
        let stored = match &last_prompt {
            Some(prompt) => self.mailbox.history(user, &prompt.conversation_id).await?,
            None => Vec::new(),
        };
        let last_turn_tokens = last_prompt.as_ref().map(|prompt| {
            prompt.token_count + last_answer.as_ref().map_or(0, |answer| answer.token_count)
        });

        let assembler = HistoryAssembler::new(
            self.settings.history,
            HistoryTurn::estimated("system", self.settings.system_init_message.clone()),
        );
        let mut history = assembler.assemble(
            &stored,
            HistoryTurn::new("user", chat.content.clone(), chat.token_count),
            last_turn_tokens,
        );
        tracing::debug!(
            conversation = %conversation_id,
            turns = history.turns.len(),
            "assembled history"
        );

        self.mailbox
            .put_last_prompt(
                user,
                &ChatTurnRecord {
                    msg_id: chat.msg_id.clone(),
                    conversation_id: conversation_id.clone(),
                    content: chat.content.clone(),
                    token_count: chat.token_count,
                },
            )
            .await?;
        self.mailbox.delete_last_answer(user).await?;
        self.mailbox
            .put_history(user, &conversation_id, &history.turns)
            .await?;

        let completion = self.complete(&chat.api_key, &history.messages()).await?;
        history.record_answer(&completion.content, completion.usage.as_ref());
        self.mailbox
            .put_history(user, &conversation_id, &history.turns)
            .await?;

        match self.mailbox.last_prompt(user).await? {
            Some(current) if current.msg_id == chat.msg_id => {
                let token_count = history.turns.last().map_or(0, |turn| turn.token_count);
                self.mailbox
                    .put_last_answer(
                        user,
                        &ChatTurnRecord {
                            msg_id: chat.msg_id.clone(),
                            conversation_id,
                            content: completion.content.clone(),
                            token_count,
                        },
                    )
                    .await?;
            }
            current => tracing::info!(
                "last prompt moved from {} to {}",
                chat.msg_id,
                current.map(|prompt| prompt.msg_id).unwrap_or_default()
            ),
        }

        Ok(completion.reply_text())
    }

    async fn complete(
        &self,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> GatewayResult<ChatCompletion> {
        let call = self.provider.create_chat_completion(api_key, messages);
        match time::timeout(self.settings.upstream_timeout, call).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(err)) => {
                tracing::warn!("chat completion failed: {err:#}");
                Err(GatewayError::upstream(err))
            }
            Err(_) => Err(GatewayError::upstream(UPSTREAM_TIMEOUT_MESSAGE)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::envelope::tests::KEY;
    use crate::channels::{PlatformKind, WeChatPlatform};
    use crate::config::{DeadlineConfig, WeChatInstanceConfig};
    use crate::providers::Usage;
    use crate::store::{KvStore, MailboxTtl, MemoryStore, StoredValue};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Scripted upstream: counts calls, can hold them until released.
    pub(crate) struct FakeProvider {
        calls: AtomicUsize,
        gated: bool,
        gate: Notify,
        fail: bool,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeProvider {
        pub(crate) fn new() -> Arc<Self> {
            Self::build(false, false)
        }

        pub(crate) fn gated() -> Arc<Self> {
            Self::build(true, false)
        }

        fn failing() -> Arc<Self> {
            Self::build(false, true)
        }

        fn build(gated: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gated,
                gate: Notify::new(),
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn release(&self) {
            self.gate.notify_one();
        }

        fn last_messages(&self) -> Vec<ChatMessage> {
            self.seen.lock().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChatProvider for FakeProvider {
        async fn create_chat_completion(
            &self,
            _api_key: &str,
            messages: &[ChatMessage],
        ) -> Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(messages.to_vec());
            if self.gated {
                self.gate.notified().await;
            }
            if self.fail {
                anyhow::bail!("OpenAI 错误\n> quota exceeded");
            }
            Ok(ChatCompletion {
                content: "answer".into(),
                finish_reason: "stop".into(),
                usage: Some(Usage {
                    prompt_tokens: 30,
                    completion_tokens: 5,
                    total_tokens: 35,
                }),
            })
        }

        async fn list_models(&self, _api_key: &str) -> Result<Vec<String>> {
            Ok(vec!["gpt-3.5-turbo".into()])
        }

        fn model(&self) -> &str {
            "gpt-3.5-turbo"
        }
    }

    /// Upstream that blows up mid-call.
    struct PanickingProvider;

    #[async_trait]
    impl ChatProvider for PanickingProvider {
        async fn create_chat_completion(
            &self,
            _api_key: &str,
            _messages: &[ChatMessage],
        ) -> Result<ChatCompletion> {
            panic!("provider crashed");
        }

        async fn list_models(&self, _api_key: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        fn model(&self) -> &str {
            "gpt-3.5-turbo"
        }
    }

    /// Store whose every access yields, widening the attempt-gate race.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl KvStore for SlowStore {
        async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>> {
            time::sleep(self.delay).await;
            self.inner.get_with_ttl(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            time::sleep(self.delay).await;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn cleanup_expired(&self) -> Result<usize> {
            self.inner.cleanup_expired().await
        }
    }

    pub(crate) fn wechat_platform() -> Arc<WeChatPlatform> {
        let config = WeChatInstanceConfig {
            id: "main".into(),
            appid: "wx-app".into(),
            token: "wechat-token".into(),
            aes_key: Some(KEY.into()),
            admin_user_ids: vec![],
            guest_key: None,
            admin_key: None,
            deadline: DeadlineConfig::wechat(),
        };
        Arc::new(WeChatPlatform::from_config(&config).unwrap())
    }

    pub(crate) fn orchestrator_with(
        store: Arc<dyn KvStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> ReplyOrchestrator<WeChatPlatform> {
        ReplyOrchestrator::new(
            wechat_platform(),
            Mailbox::new(store, MailboxTtl::default()),
            provider,
            OrchestratorSettings::from_config(&OpenAiConfig::default()),
        )
    }

    fn orchestrator(provider: Arc<dyn ChatProvider>) -> ReplyOrchestrator<WeChatPlatform> {
        orchestrator_with(Arc::new(MemoryStore::new()), provider)
    }

    fn user() -> UserKey {
        UserKey::new("wechat", "wx-app", "openid-1")
    }

    fn chat(msg_id: &str, content: &str, chat_type: ChatType) -> ChatRequest {
        ChatRequest {
            user: user(),
            msg_id: msg_id.into(),
            content: content.into(),
            token_count: crate::agent::history::estimate_token_count(content),
            api_key: "sk-test".into(),
            chat_type,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(PlatformKind::WeChat, "main")
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_waits_without_second_upstream_call() -> Result<()> {
        let provider = FakeProvider::gated();
        let orch = orchestrator(provider.clone());

        let first = orch.deliver(&ctx(), chat("42", "hi", ChatType::Single)).await?;
        assert_eq!(
            first,
            DeliveryOutcome::Pending {
                msg_id: "42".into(),
                attempt: 1
            }
        );

        let second = orch.deliver(&ctx(), chat("42", "hi", ChatType::Single)).await?;
        assert_eq!(
            second,
            DeliveryOutcome::Pending {
                msg_id: "42".into(),
                attempt: 2
            }
        );
        assert_eq!(second.clone().into_reply(), retry_instruction("42"));
        assert_eq!(provider.calls(), 1);
        assert_eq!(orch.mailbox().attempt(&user(), "42").await?.map(|r| r.count), Some(2));
        assert_eq!(orch.mailbox().delayed(&user()).await?.as_deref(), Some("42"));

        provider.release();
        let third = orch.deliver(&ctx(), chat("42", "hi", ChatType::Single)).await?;
        assert_eq!(third, DeliveryOutcome::Answered("answer".into()));
        assert_eq!(provider.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cached_answer_short_circuits_any_attempt() -> Result<()> {
        let provider = FakeProvider::new();
        let orch = orchestrator(provider.clone());
        let record = AttemptRecord {
            count: 5,
            first_seen_ms: unix_millis_now(),
        };
        orch.mailbox().put_attempt(&user(), "7", &record).await?;
        orch.mailbox().put_answer(&user(), "7", "cached").await?;

        let outcome = orch.deliver(&ctx(), chat("7", "hi", ChatType::Single)).await?;
        assert_eq!(outcome, DeliveryOutcome::Answered("cached".into()));
        assert_eq!(provider.calls(), 0);
        assert_eq!(orch.mailbox().attempt(&user(), "7").await?.map(|r| r.count), Some(6));
        Ok(())
    }

    #[tokio::test]
    async fn first_delivery_returns_fast_answer_and_caches_it() -> Result<()> {
        let provider = FakeProvider::new();
        let orch = orchestrator(provider.clone());

        let outcome = orch.deliver(&ctx(), chat("1", "hi", ChatType::Single)).await?;
        assert_eq!(outcome, DeliveryOutcome::Answered("answer".into()));
        assert_eq!(orch.mailbox().answer(&user(), "1").await?.as_deref(), Some("answer"));

        let messages = provider.last_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        Ok(())
    }

    #[tokio::test]
    async fn upstream_failure_becomes_the_cached_answer() -> Result<()> {
        let orch = orchestrator(FakeProvider::failing());
        let outcome = orch.deliver(&ctx(), chat("9", "hi", ChatType::Single)).await?;
        let DeliveryOutcome::Answered(text) = outcome else {
            panic!("expected an answer");
        };
        assert!(text.contains("quota exceeded"));
        assert_eq!(orch.mailbox().answer(&user(), "9").await?, Some(text));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out_into_answer() -> Result<()> {
        let orch = orchestrator(FakeProvider::gated());
        let first = orch.deliver(&ctx(), chat("5", "hi", ChatType::Single)).await?;
        assert!(matches!(first, DeliveryOutcome::Pending { .. }));

        // Upstream timeout (30s) passes while the platform keeps retrying.
        time::sleep(Duration::from_secs(30)).await;
        let answer = orch.mailbox().answer(&user(), "5").await?;
        assert_eq!(answer.as_deref(), Some(UPSTREAM_TIMEOUT_MESSAGE));
        Ok(())
    }

    #[tokio::test]
    async fn multi_turn_updates_conversation_state() -> Result<()> {
        let provider = FakeProvider::new();
        let orch = orchestrator(provider.clone());

        orch.deliver(&ctx(), chat("1", "first question", ChatType::Multi))
            .await?;
        let prompt = orch.mailbox().last_prompt(&user()).await?.unwrap();
        let answer = orch.mailbox().last_answer(&user()).await?.unwrap();
        assert_eq!(prompt.msg_id, "1");
        assert_eq!(answer.content, "answer");
        assert_eq!(answer.token_count, 5);

        let history = orch
            .mailbox()
            .history(&user(), &prompt.conversation_id)
            .await?;
        let roles: Vec<&str> = history.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);

        orch.deliver(&ctx(), chat("2", "follow up", ChatType::Multi))
            .await?;
        let sent: Vec<String> = provider
            .last_messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1], "first question");
        assert_eq!(sent[2], "answer");
        assert_eq!(sent[3], "follow up");

        let prompt2 = orch.mailbox().last_prompt(&user()).await?.unwrap();
        assert_eq!(prompt2.conversation_id, prompt.conversation_id);
        Ok(())
    }

    #[tokio::test]
    async fn newer_prompt_keeps_older_answer_out_of_last_answer() -> Result<()> {
        let provider = FakeProvider::gated();
        let orch = orchestrator(provider.clone());

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.deliver(&ctx(), chat("A", "first", ChatType::Multi)).await })
        };
        while provider.calls() < 1 {
            tokio::task::yield_now().await;
        }
        let second = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.deliver(&ctx(), chat("B", "second", ChatType::Multi)).await })
        };
        while provider.calls() < 2 {
            tokio::task::yield_now().await;
        }

        provider.release();
        provider.release();
        assert_eq!(first.await??, DeliveryOutcome::Answered("answer".into()));
        assert_eq!(second.await??, DeliveryOutcome::Answered("answer".into()));
        assert_eq!(provider.calls(), 2);

        let mailbox = orch.mailbox();
        assert_eq!(mailbox.answer(&user(), "A").await?.as_deref(), Some("answer"));
        assert_eq!(mailbox.answer(&user(), "B").await?.as_deref(), Some("answer"));
        let prompt = mailbox.last_prompt(&user()).await?.unwrap();
        let answer = mailbox.last_answer(&user()).await?.unwrap();
        assert_eq!(prompt.msg_id, "B");
        assert_eq!(answer.msg_id, "B");
        Ok(())
    }

    #[tokio::test]
    async fn crashed_upstream_task_releases_its_slot() -> Result<()> {
        let orch = orchestrator(Arc::new(PanickingProvider));
        let outcome = orch.deliver(&ctx(), chat("13", "hi", ChatType::Single)).await?;
        assert!(matches!(outcome, DeliveryOutcome::Pending { .. }));
        assert!(orch.inflight.lock().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_acknowledges_early_attempts_after_slack() -> Result<()> {
        let orch = orchestrator(FakeProvider::gated());
        let ctx = ctx();
        let (worker, worker_ctx) = (orch.clone(), ctx.clone());

        let started = time::Instant::now();
        let reply = orch
            .respond(&ctx, async move {
                match worker
                    .deliver(&worker_ctx, chat("11", "hi", ChatType::Single))
                    .await
                {
                    Ok(outcome) => Reply::Text(outcome.into_reply()),
                    Err(err) => Reply::Text(err.user_message().to_string()),
                }
            })
            .await;

        assert_eq!(reply, Reply::Text(PROCESSING_ACK.into()));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(6_500));
        assert!(elapsed < Duration::from_secs(7));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_on_late_attempt_gives_retry_instruction() -> Result<()> {
        let orch = orchestrator(FakeProvider::gated());
        let record = AttemptRecord {
            count: 2,
            first_seen_ms: unix_millis_now(),
        };
        orch.mailbox().put_attempt(&user(), "12", &record).await?;

        let ctx = ctx();
        let (worker, worker_ctx) = (orch.clone(), ctx.clone());
        let reply = orch
            .respond(&ctx, async move {
                let outcome = worker
                    .deliver(&worker_ctx, chat("12", "hi", ChatType::Single))
                    .await;
                Reply::Text(outcome.map(DeliveryOutcome::into_reply).unwrap_or_default())
            })
            .await;

        assert_eq!(reply, Reply::Text(retry_instruction("12")));
        assert_eq!(orch.mailbox().delayed(&user()).await?.as_deref(), Some("12"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_upstream_is_a_service_error() {
        let orch = orchestrator(FakeProvider::new());
        let reply = orch
            .respond(&ctx(), async {
                time::sleep(Duration::from_secs(60)).await;
                Reply::Success
            })
            .await;
        assert_eq!(reply, Reply::Text(SERVICE_BUSY.into()));
    }

    #[tokio::test]
    async fn concurrent_duplicates_may_double_dispatch_but_agree() -> Result<()> {
        let provider = FakeProvider::new();
        let store: Arc<dyn KvStore> = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(20),
        });
        let orch = orchestrator_with(store, provider.clone());

        let (c1, c2) = (ctx(), ctx());
        let (a, b) = tokio::join!(
            orch.deliver(&c1, chat("99", "hi", ChatType::Single)),
            orch.deliver(&c2, chat("99", "hi", ChatType::Single)),
        );
        assert_eq!(a?, DeliveryOutcome::Answered("answer".into()));
        assert_eq!(b?, DeliveryOutcome::Answered("answer".into()));
        assert!((1..=2).contains(&provider.calls()));
        assert_eq!(
            orch.mailbox().answer(&user(), "99").await?.as_deref(),
            Some("answer")
        );
        Ok(())
    }
}
