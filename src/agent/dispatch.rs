//! Turns a parsed envelope into the reply text.

use super::commands::{handle_command, CommandEnv};
use super::context::{ChatType, RequestContext, UserContext};
use super::history::estimate_token_count;
use super::orchestrator::{ChatRequest, Reply, ReplyOrchestrator};
use crate::channels::{InboundHeader, ParsedEnvelope, Platform, TypedMessage};
use crate::config::{GatewayConfig, OpenAiConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::security::Role;
use crate::store::UserKey;
use std::sync::Arc;

const TEXT_ONLY: &str = "只支持文字消息";
const INPUT_TOO_LONG: &str = "输入太长，不能多于约 2000 个汉字";
const NO_API_KEY: &str = "未绑定 OpenAI api key，请先使用 /bindKey 命令进行绑定";

/// Per-instance message router in front of the [`ReplyOrchestrator`].
pub struct Dispatcher<P: Platform> {
    orchestrator: ReplyOrchestrator<P>,
    openai: Arc<OpenAiConfig>,
    gateway: Arc<GatewayConfig>,
}

impl<P: Platform> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            openai: Arc::clone(&self.openai),
            gateway: Arc::clone(&self.gateway),
        }
    }
}

impl<P: Platform> Dispatcher<P> {
    pub fn new(
        orchestrator: ReplyOrchestrator<P>,
        openai: Arc<OpenAiConfig>,
        gateway: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            orchestrator,
            openai,
            gateway,
        }
    }

    pub fn platform(&self) -> &Arc<P> {
        self.orchestrator.platform()
    }

    /// [`Self::handle`] raced against the platform's response deadline.
    pub async fn respond(&self, ctx: &RequestContext, envelope: ParsedEnvelope) -> Reply {
        let this = self.clone();
        let task_ctx = ctx.clone();
        self.orchestrator
            .respond(ctx, async move { this.handle(&task_ctx, &envelope).await })
            .await
    }

    pub async fn handle(&self, ctx: &RequestContext, envelope: &ParsedEnvelope) -> Reply {
        match &envelope.message {
            TypedMessage::Subscribe { .. } => Reply::Text(self.openai.welcome_message.clone()),
            TypedMessage::Unsubscribe | TypedMessage::Event { .. } => Reply::Success,
            TypedMessage::Text { content } => self.reply_to_text(ctx, &envelope.header, content).await,
            TypedMessage::Voice {
                recognition: Some(content),
                ..
            } if !content.trim().is_empty() => {
                self.reply_to_text(ctx, &envelope.header, content).await
            }
            other => {
                tracing::debug!(msg_type = other.msg_type(), "unsupported message type");
                Reply::Text(TEXT_ONLY.to_string())
            }
        }
    }

    async fn reply_to_text(&self, ctx: &RequestContext, header: &InboundHeader, content: &str) -> Reply {
        match self.handle_text(ctx, header, content).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(kind = err.kind(), "failed to handle text message: {err}");
                Reply::Text(err.user_message().to_string())
            }
        }
    }

    async fn handle_text(
        &self,
        ctx: &RequestContext,
        header: &InboundHeader,
        content: &str,
    ) -> GatewayResult<Reply> {
        let content = content.trim();
        let token_count = estimate_token_count(content);
        if token_count >= self.openai.max_chat_tokens {
            tracing::info!(token_count, "input too long");
            return Ok(Reply::Text(INPUT_TOO_LONG.to_string()));
        }

        let mut user = self.load_user(header).await?;
        tracing::debug!(user = user.user_id(), roles = %user.roles, "user context");

        if self.gateway.echo_mode {
            return Ok(Reply::Text(content.to_string()));
        }

        let env = CommandEnv {
            mailbox: self.orchestrator.mailbox(),
            provider: self.orchestrator.provider().as_ref(),
            openai: &self.openai,
            gateway: &self.gateway,
            request: ctx,
        };
        if let Some(text) = handle_command(&env, &mut user, content).await {
            return Ok(Reply::Text(text));
        }

        if !user.has_api_key() {
            return Ok(Reply::Text(NO_API_KEY.to_string()));
        }

        let msg_id = header
            .msg_id
            .clone()
            .ok_or_else(|| GatewayError::validation("text message without MsgId"))?;
        let chat = ChatRequest {
            user: user.key,
            msg_id,
            content: content.to_string(),
            token_count,
            api_key: user.api_key,
            chat_type: user.chat_type,
        };
        let outcome = self.orchestrator.deliver(ctx, chat).await?;
        Ok(Reply::Text(outcome.into_reply()))
    }

    /// Resolves key, roles and chat mode from stored state.
    async fn load_user(&self, header: &InboundHeader) -> GatewayResult<UserContext> {
        let platform = self.orchestrator.platform();
        let mailbox = self.orchestrator.mailbox();
        let user_id = header.from_user.as_str();
        let mut user = UserContext::new(UserKey::new(
            P::KIND.as_str(),
            platform.account_id(),
            user_id,
        ));

        let is_admin = platform.is_admin_user(user_id)
            || (platform.honors_admin_grants() && mailbox.is_admin(user_id).await?);

        if let Some(own) = mailbox.api_key(&user.key).await? {
            user.api_key = own;
            user.roles.promote_to_user();
        } else if let Some(fallback) = platform.fallback_key(&self.openai, is_admin) {
            user.api_key = fallback.api_key;
            if fallback.free_trial {
                user.roles.insert(Role::FreeTrial);
            }
        }
        if is_admin {
            user.roles.insert(Role::Admin);
        }

        if let Some(raw) = mailbox.chat_type(&user.key).await? {
            user.chat_type = ChatType::parse(&raw).unwrap_or_default();
        }
        Ok(user)
    }
}
