//! Slash commands typed into the chat.
//!
//! Matching is a linear, case-insensitive scan of [`COMMANDS`]; the first
//! entry whose name equals the message or prefixes it followed by a space
//! wins. Entries whose roles the sender lacks are skipped.

use super::context::{ChatType, RequestContext, UserContext};
use super::orchestrator::retry_instruction;
use crate::config::{GatewayConfig, OpenAiConfig};
use crate::error::GatewayResult;
use crate::providers::ChatProvider;
use crate::security::Role;
use crate::store::Mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Help,
    BindKey,
    UnbindKey,
    TestKey,
    SetChatType,
    NewChat,
    Retry,
    System,
    Faq,
    AdminAuth,
}

pub struct Command {
    pub name: &'static str,
    pub description: &'static str,
    pub roles: &'static [Role],
    /// Left out of `/help`.
    pub hidden: bool,
    kind: CommandKind,
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "/help",
        description: "获取命令帮助信息",
        roles: &[Role::Guest, Role::User],
        hidden: false,
        kind: CommandKind::Help,
    },
    Command {
        name: "/bindKey",
        description: "绑定 OpenAI api key，格式如 /bindKey xxx。如已绑定 key，则会覆盖。可以先用 /testKey 命令测试是否正常可用",
        roles: &[Role::Guest, Role::User],
        hidden: false,
        kind: CommandKind::BindKey,
    },
    Command {
        name: "/unbindKey",
        description: "解绑 OpenAI api key",
        roles: &[Role::User],
        hidden: false,
        kind: CommandKind::UnbindKey,
    },
    Command {
        name: "/testKey",
        description: "调用 OpenAI 列出模型接口，测试 api key 是否正常绑定可用，不消耗用量",
        roles: &[Role::User],
        hidden: false,
        kind: CommandKind::TestKey,
    },
    Command {
        name: "/setChatType",
        description: "切换对话模式，可选'单聊'和'串聊'，默认'单聊'。'单聊'只处理当前的输入，'串聊'会带上历史聊天记录请求 OpenAI，消耗更多用量",
        roles: &[Role::User, Role::FreeTrial],
        hidden: false,
        kind: CommandKind::SetChatType,
    },
    Command {
        name: "/newChat",
        description: "清除之前的串聊历史记录，开始新的串聊",
        roles: &[Role::User, Role::FreeTrial],
        hidden: false,
        kind: CommandKind::NewChat,
    },
    Command {
        name: "/retry",
        description: "根据 msgId 获取对应回答，不带 msgId 时获取最近一次未及时返回的回答。回答只会保留几分钟",
        roles: &[Role::User, Role::FreeTrial],
        hidden: false,
        kind: CommandKind::Retry,
    },
    Command {
        name: "/system",
        description: "查看当前一些系统配置信息",
        roles: &[Role::User, Role::Admin],
        hidden: false,
        kind: CommandKind::System,
    },
    Command {
        name: "/faq",
        description: "一些常见问题",
        roles: &[Role::Guest, Role::User],
        hidden: false,
        kind: CommandKind::Faq,
    },
    Command {
        name: "/adminAuth",
        description: "通过 token 认证成为 admin",
        roles: &[Role::Guest, Role::User],
        hidden: true,
        kind: CommandKind::AdminAuth,
    },
];

const FAQ: &[&str] = &[
    "只能发纯文本消息",
    "输入命令可忽略大小写",
    "一些平台会限制回复用户消息的最大等待时间，如微信限制 15 秒内必须回复否则提示公众号服务故障，而 OpenAI 可能需要更长时间处理，这种情况会先返回提示消息，在后台继续处理",
    "串聊会带上历史消息，一方面会消耗更多用量，另一方面容易达到 OpenAI 消息总长上限，应常用使用命令 /newChat 清除历史",
    "串聊避免短时间连续提问，会影响历史消息连贯性",
    "串聊历史记录不使用则最长保留一天，OpenAI api key 不使用最长保留一个月",
];

const COMMAND_FAILED: &str = "服务异常：执行命令失败";

/// Shared collaborators a command may touch.
pub struct CommandEnv<'a> {
    pub mailbox: &'a Mailbox,
    pub provider: &'a dyn ChatProvider,
    pub openai: &'a OpenAiConfig,
    pub gateway: &'a GatewayConfig,
    pub request: &'a RequestContext,
}

/// Finds the command `message` invokes and returns it with its parameters.
pub fn match_command<'m>(message: &'m str, user: &UserContext) -> Option<(&'static Command, &'m str)> {
    COMMANDS.iter().find_map(|command| {
        if !user.roles.intersects(command.roles) {
            return None;
        }
        let rest = strip_command(message, command.name)?;
        if rest.is_empty() || rest.starts_with(' ') {
            Some((command, rest.trim()))
        } else {
            None
        }
    })
}

fn strip_command<'m>(message: &'m str, name: &str) -> Option<&'m str> {
    let head = message.get(..name.len())?;
    head.eq_ignore_ascii_case(name)
        .then(|| &message[name.len()..])
}

/// Runs the matching command, or returns `None` when the message is not one.
pub async fn handle_command(
    env: &CommandEnv<'_>,
    user: &mut UserContext,
    message: &str,
) -> Option<String> {
    let (command, params) = match_command(message, user)?;
    tracing::info!(command = command.name, params, "running command");

    let result = match command.kind {
        CommandKind::Help => Ok(help_text(user, params)),
        CommandKind::BindKey => bind_key(env, user, params).await,
        CommandKind::UnbindKey => env
            .mailbox
            .delete_api_key(&user.key)
            .await
            .map(|()| "解绑成功".to_string()),
        CommandKind::TestKey => Ok(test_key(env, user).await),
        CommandKind::SetChatType => set_chat_type(env, user, params).await,
        CommandKind::NewChat => env
            .mailbox
            .delete_last_prompt(&user.key)
            .await
            .map(|()| "建立新串聊成功".to_string()),
        CommandKind::Retry => retry(env, user, params).await,
        CommandKind::System => system_info(env, user).await,
        CommandKind::Faq => Ok(faq_text()),
        CommandKind::AdminAuth => admin_auth(env, user, params).await,
    };

    Some(result.unwrap_or_else(|err| {
        tracing::error!(command = command.name, "command failed: {err}");
        COMMAND_FAILED.to_string()
    }))
}

fn help_text(user: &UserContext, subcommand: &str) -> String {
    let visible = |command: &&Command| !command.hidden && user.roles.intersects(command.roles);

    let listed: Vec<&Command> = if subcommand.is_empty() {
        COMMANDS.iter().filter(visible).collect()
    } else {
        match COMMANDS
            .iter()
            .filter(visible)
            .find(|command| command.name.eq_ignore_ascii_case(subcommand))
        {
            Some(command) => vec![command],
            None => return format!("命令 {subcommand} 不存在"),
        }
    };

    let lines: Vec<String> = listed
        .iter()
        .map(|command| format!("⭐【{}】: {}", command.name, command.description))
        .collect();
    format!("当前支持以下命令:\n{}", lines.join("\n"))
}

fn faq_text() -> String {
    FAQ.iter()
        .enumerate()
        .map(|(idx, item)| format!("{}. {item}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn bind_key(env: &CommandEnv<'_>, user: &UserContext, key: &str) -> GatewayResult<String> {
    let len = key.chars().count();
    if len < env.openai.api_key_min_len || len > env.openai.api_key_max_len {
        return Ok("绑定失败 key 格式不合法".to_string());
    }
    env.mailbox.put_api_key(&user.key, key).await?;
    Ok("绑定成功".to_string())
}

async fn test_key(env: &CommandEnv<'_>, user: &UserContext) -> String {
    match env.provider.list_models(&user.api_key).await {
        Ok(_) => "测试成功".to_string(),
        Err(err) => format!("测试失败 {err}"),
    }
}

async fn set_chat_type(
    env: &CommandEnv<'_>,
    user: &mut UserContext,
    params: &str,
) -> GatewayResult<String> {
    let Some(chat_type) = ChatType::parse(params) else {
        return Ok("输入不合法，应输入'单聊'或'串聊'，请重新输入".to_string());
    };
    env.mailbox
        .put_chat_type(&user.key, chat_type.as_str())
        .await?;
    user.chat_type = chat_type;
    Ok(format!("切换为'{chat_type}'成功"))
}

async fn retry(env: &CommandEnv<'_>, user: &UserContext, params: &str) -> GatewayResult<String> {
    let msg_id = if params.is_empty() {
        match env.mailbox.delayed(&user.key).await? {
            Some(msg_id) => msg_id,
            None => return Ok("msgId 为空".to_string()),
        }
    } else {
        params.to_string()
    };

    if env.mailbox.attempt(&user.key, &msg_id).await?.is_none() {
        return Ok("该 msgId 无记录，可能已过期".to_string());
    }
    Ok(env
        .mailbox
        .answer(&user.key, &msg_id)
        .await?
        .unwrap_or_else(|| retry_instruction(&msg_id)))
}

async fn system_info(env: &CommandEnv<'_>, user: &UserContext) -> GatewayResult<String> {
    let mut lines = vec![
        "当前系统信息如下: ".to_string(),
        format!("⭐OpenAI 模型: {}", env.provider.model()),
        format!("⭐OpenAI api key: {}", mask_api_key(&user.api_key)),
        format!("⭐OpenAI 对话模式: {}", user.chat_type),
        format!("⭐当前用户: {}", user.user_id()),
    ];

    if env.gateway.debug_mode {
        lines.push(format!("⭐初始化文本: {}", env.openai.system_init_message));
        lines.push(format!("⭐当前 reqId: {}", env.request.request_id));
        lines.push(format!("⭐当前角色: {}", user.roles));
        if let Some(prompt) = env.mailbox.last_prompt(&user.key).await? {
            lines.push(format!("⭐当前 conversationId: {}", prompt.conversation_id));
        }
    }

    if user.roles.contains(Role::Admin) {
        let token = match env.gateway.admin_auth_token.as_deref() {
            Some(token) if !token.is_empty() => {
                format!("{}****", token.chars().take(4).collect::<String>())
            }
            _ => "无".to_string(),
        };
        lines.push(format!("⭐当前 ADMIN_AUTH_TOKEN: {token}"));
    }

    Ok(lines.join("\n"))
}

async fn admin_auth(env: &CommandEnv<'_>, user: &UserContext, token: &str) -> GatewayResult<String> {
    let Some(expected) = env
        .gateway
        .admin_auth_token
        .as_deref()
        .filter(|token| !token.is_empty())
    else {
        return Ok("失败".to_string());
    };
    if token != expected {
        tracing::warn!(user = user.user_id(), "admin auth rejected");
        return Ok("失败".to_string());
    }
    env.mailbox.put_admin(user.user_id()).await?;
    Ok("成功".to_string())
}

/// `sk-abc…wxyz` style masking: first six and last four characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let head: String = chars.iter().take(6).collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{head}****{tail}")
}
