//! Axum-based HTTP surface for the callback platforms.
//!
//! `GET /openai/{platform}/{id}` answers the URL verification handshake and
//! `POST` on the same path carries messages. Both look the instance up by
//! platform segment and id; anything unconfigured is a 400.

use crate::agent::context::RequestContext;
use crate::agent::dispatch::Dispatcher;
use crate::agent::orchestrator::{OrchestratorSettings, Reply, ReplyOrchestrator};
use crate::channels::{Platform, WeChatPlatform, WeWorkPlatform};
use crate::config::{Config, GatewayConfig, OpenAiConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{ChatProvider, OpenAiProvider};
use crate::store::{create_store, KvStore, Mailbox, MailboxTtl};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::Instrument;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    wechat: Arc<HashMap<String, Dispatcher<WeChatPlatform>>>,
    wework: Arc<HashMap<String, Dispatcher<WeWorkPlatform>>>,
}

impl AppState {
    /// One dispatcher per configured instance, all sharing one mailbox and
    /// one upstream client.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn KvStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self> {
        let mailbox = Mailbox::new(
            store,
            MailboxTtl {
                attempt: Duration::from_secs(config.openai.attempt_ttl_secs),
                answer: Duration::from_secs(config.openai.answer_ttl_secs),
                ..MailboxTtl::default()
            },
        );

        let shared = SharedParts {
            mailbox,
            provider,
            openai: Arc::new(config.openai.clone()),
            gateway: Arc::new(config.gateway.clone()),
        };

        let mut wechat = HashMap::new();
        for instance in &config.wechat {
            let platform = WeChatPlatform::from_config(instance)
                .with_context(|| format!("wechat instance `{}`", instance.id))?;
            wechat.insert(instance.id.clone(), shared.dispatcher(platform));
        }

        let mut wework = HashMap::new();
        for instance in &config.wework {
            let platform = WeWorkPlatform::from_config(instance)
                .with_context(|| format!("wework instance `{}`", instance.id))?;
            wework.insert(instance.id.clone(), shared.dispatcher(platform));
        }

        Ok(Self {
            wechat: Arc::new(wechat),
            wework: Arc::new(wework),
        })
    }
}

struct SharedParts {
    mailbox: Mailbox,
    provider: Arc<dyn ChatProvider>,
    openai: Arc<OpenAiConfig>,
    gateway: Arc<GatewayConfig>,
}

impl SharedParts {
    fn dispatcher<P: Platform>(&self, platform: P) -> Dispatcher<P> {
        let orchestrator = ReplyOrchestrator::new(
            Arc::new(platform),
            self.mailbox.clone(),
            Arc::clone(&self.provider),
            OrchestratorSettings::from_config(&self.openai),
        );
        Dispatcher::new(orchestrator, Arc::clone(&self.openai), Arc::clone(&self.gateway))
    }
}

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handle_health))
        .route(
            "/openai/{platform}/{id}",
            get(handle_verify).post(handle_callback),
        )
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let store = create_store(&config.store)?;
    let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(&config.openai)?);
    let state = AppState::from_config(&config, store, provider)?;
    let app = build_router(state, config.gateway.max_body_bytes);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        wechat = config.wechat.len(),
        wework = config.wework.len(),
        "wxbridge listening on http://{}",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn handle_health() -> String {
    format!("{} hello world", chrono::Utc::now().to_rfc3339())
}

async fn handle_verify(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = match platform.as_str() {
        "wechat" => lookup(&state.wechat, &id).and_then(|d| d.platform().handshake(&query)),
        "wework" => lookup(&state.wework, &id).and_then(|d| d.platform().handshake(&query)),
        other => Err(GatewayError::UnknownPlatform(other.to_string())),
    };
    match result {
        Ok(echo) => (StatusCode::OK, echo).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_callback(
    State(state): State<AppState>,
    Path((platform, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let result = match platform.as_str() {
        "wechat" => match lookup(&state.wechat, &id) {
            Ok(dispatcher) => Ok(process(dispatcher, &query, &body).await),
            Err(err) => Err(err),
        },
        "wework" => match lookup(&state.wework, &id) {
            Ok(dispatcher) => Ok(process(dispatcher, &query, &body).await),
            Err(err) => Err(err),
        },
        other => Err(GatewayError::UnknownPlatform(other.to_string())),
    };
    result.unwrap_or_else(|err| error_response(&err))
}

fn lookup<'a, P: Platform>(
    instances: &'a HashMap<String, Dispatcher<P>>,
    id: &str,
) -> GatewayResult<&'a Dispatcher<P>> {
    instances
        .get(id)
        .ok_or_else(|| GatewayError::UnknownInstance(id.to_string()))
}

async fn process<P: Platform>(
    dispatcher: &Dispatcher<P>,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Response {
    let platform = dispatcher.platform();
    let ctx = RequestContext::new(P::KIND, platform.id());
    let span = ctx.span();

    async {
        let Ok(xml) = std::str::from_utf8(body) else {
            return error_response(&GatewayError::validation("body is not UTF-8"));
        };
        let envelope = match platform.parse_envelope(xml, query) {
            Ok(envelope) => envelope,
            Err(err) => return error_response(&err),
        };
        tracing::info!(
            user = %envelope.header.from_user,
            msg_type = envelope.message.msg_type(),
            msg_id = envelope.header.msg_id.as_deref().unwrap_or(""),
            encrypted = envelope.is_encrypted,
            "callback received"
        );

        let content = match dispatcher.respond(&ctx, envelope.clone()).await {
            Reply::Success => return (StatusCode::OK, "success").into_response(),
            Reply::Text(content) => content,
        };
        match platform.render_reply(&envelope, &content) {
            Ok(xml) => {
                tracing::debug!(elapsed_ms = ctx.started_at.elapsed().as_millis() as u64, "reply sent");
                (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], xml).into_response()
            }
            Err(err) => error_response(&err),
        }
    }
    .instrument(span)
    .await
}

fn error_response(err: &GatewayError) -> Response {
    if err.status_code().is_server_error() {
        tracing::error!(kind = err.kind(), "request failed: {err}");
    } else {
        tracing::warn!(kind = err.kind(), "request rejected: {err}");
    }
    (err.status_code(), err.user_message()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::orchestrator::tests::FakeProvider;
    use crate::channels::envelope::tests::{encrypted_request, text_xml, KEY};
    use crate::channels::reply::cdata;
    use crate::config::{DeadlineConfig, WeChatInstanceConfig, WeWorkInstanceConfig};
    use crate::security::compute_signature;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn config(echo_mode: bool) -> Config {
        Config {
            gateway: GatewayConfig {
                echo_mode,
                ..GatewayConfig::default()
            },
            wechat: vec![WeChatInstanceConfig {
                id: "main".into(),
                appid: "wx-app".into(),
                token: "wechat-token".into(),
                aes_key: None,
                admin_user_ids: vec![],
                guest_key: None,
                admin_key: None,
                deadline: DeadlineConfig::wechat(),
            }],
            wework: vec![WeWorkInstanceConfig {
                id: "corp".into(),
                corp_id: "ww-corp".into(),
                token: "wework-token".into(),
                aes_key: KEY.into(),
                admin_user_ids: vec![],
                deadline: DeadlineConfig::wework(),
            }],
            ..Config::default()
        }
    }

    fn app(echo_mode: bool) -> Router {
        let config = config(echo_mode);
        let state = AppState::from_config(
            &config,
            Arc::new(MemoryStore::new()),
            FakeProvider::new(),
        )
        .unwrap();
        build_router(state, config.gateway.max_body_bytes)
    }

    fn wechat_query(token: &str) -> String {
        let signature = compute_signature(&[token, "1700000000", "nonce1"]);
        format!("signature={signature}&timestamp=1700000000&nonce=nonce1")
    }

    fn query_string(params: &HashMap<String, String>) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn root_says_hello() {
        let (status, body) = send(app(false), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with(" hello world"));
    }

    #[tokio::test]
    async fn wechat_handshake_echoes_echostr() {
        let uri = format!("/openai/wechat/main?{}&echostr=shr5ch", wechat_query("wechat-token"));
        let (status, body) = send(app(false), get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "shr5ch");

        let uri = format!("/openai/wechat/main?{}&echostr=shr5ch", wechat_query("forged"));
        let (status, body) = send(app(false), get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "签名不合法");
    }

    #[tokio::test]
    async fn unknown_platform_and_instance_are_rejected() {
        let (status, body) = send(app(false), get("/openai/slack/main")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "平台不合法");

        let (status, body) = send(app(false), post("/openai/wework/nope", String::new())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "平台ID不合法");
    }

    #[tokio::test]
    async fn echo_mode_round_trips_plaintext() {
        let uri = format!("/openai/wechat/main?{}", wechat_query("wechat-token"));
        let xml = text_xml("gh_1", "openid-1", "100", "ping");
        let (status, body) = send(app(true), post(&uri, xml)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&format!("<ToUserName>{}</ToUserName>", cdata("openid-1"))));
        assert!(body.contains(&format!("<FromUserName>{}</FromUserName>", cdata("gh_1"))));
        assert!(body.contains(&format!("<Content>{}</Content>", cdata("ping"))));
    }

    #[tokio::test]
    async fn events_answer_success() {
        let uri = format!("/openai/wechat/main?{}", wechat_query("wechat-token"));
        let xml = "<xml><ToUserName><![CDATA[gh_1]]></ToUserName>\
                   <FromUserName><![CDATA[openid-1]]></FromUserName>\
                   <CreateTime>1700000000</CreateTime><MsgType><![CDATA[event]]></MsgType>\
                   <Event><![CDATA[unsubscribe]]></Event></xml>";
        let (status, body) = send(app(false), post(&uri, xml.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
    }

    #[tokio::test]
    async fn foreign_account_gets_no_reply_content() {
        let inner = text_xml("ww-corp", "zhangsan", "200", "hi")
            .replace("</xml>", &format!("<AgentID>{}</AgentID></xml>", cdata("1000002")));
        let (body, query) = encrypted_request(&inner, "ww-intruder", "wework-token");
        let uri = format!("/openai/wework/corp?{}", query_string(&query));

        let (status, reply) = send(app(true), post(&uri, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply, "appid 不符");
    }

    #[tokio::test]
    async fn wework_replies_are_encrypted() {
        let inner = text_xml("ww-corp", "zhangsan", "201", "hi")
            .replace("</xml>", &format!("<AgentID>{}</AgentID></xml>", cdata("1000002")));
        let (body, query) = encrypted_request(&inner, "ww-corp", "wework-token");
        let uri = format!("/openai/wework/corp?{}", query_string(&query));

        let (status, reply) = send(app(true), post(&uri, body)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(reply.contains("<Encrypt>"));
        assert!(reply.contains("<MsgSignature>"));
    }
}
