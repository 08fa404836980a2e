pub mod backend;
pub mod error;
pub mod handler;
pub mod model;
pub mod service;
pub mod translator;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use salvo::{affix_state, prelude::*};

use crate::config::AtomicConfig;
use handler::{allow_any_origin, chat_completions, chat_completions_options, verify_app_secret};

/// HTTP 客户端类型别名
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// 持有所有请求复用的上游 HTTP 客户端
pub struct GatewayHandler {
    pub client: Arc<HttpClient>,
}

impl GatewayHandler {
    pub fn new() -> Self {
        // webpki-roots 内置证书，不依赖系统证书
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(https);

        Self {
            client: Arc::new(client),
        }
    }

    /// 构建路由，通过 `affix_state` 注入配置与客户端
    pub fn router(&self, config: Arc<AtomicConfig>) -> Router {
        Router::new()
            .hoop(affix_state::inject(config).inject(Arc::clone(&self.client)))
            .hoop(allow_any_origin)
            .push(
                Router::with_path("v1/chat/completions")
                    .options(chat_completions_options)
                    .push(Router::new().hoop(verify_app_secret).post(chat_completions)),
            )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::path::PathBuf;

    use salvo::test::{ResponseExt, TestClient};
    use serde_json::{Value, json};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;
    use crate::{config::Config, gateway::model::CompletionObject};

    const URL: &str = "http://127.0.0.1:8001/v1/chat/completions";
    const SECRET: &str = "sk-test-secret";
    const UPSTREAM_BODY: &str = "data: Hello\ndata:  trylimit\ndata: \\nWorld\n";

    fn service_for(backend_url: &str, keep_sentinel: bool) -> Service {
        let mut config = Config {
            app_secret: Some(SECRET.to_owned()),
            keep_sentinel_in_full_response: keep_sentinel,
            ..Config::default()
        };
        config.backend.base_url = backend_url.to_owned();
        let atomic = Arc::new(AtomicConfig::from_config(
            config,
            PathBuf::from("config.toml"),
        ));
        Service::new(GatewayHandler::new().router(atomic))
    }

    fn chat_body(model: &str, stream: bool) -> Value {
        json!({
            "model": model,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "stream": stream
        })
    }

    async fn mount_backend(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/chat/send2/"))
            .and(body_json(json!({
                "type": "chat",
                "messagesHistory": [
                    {"from": "chatGPT", "content": "be brief"},
                    {"from": "you", "content": "hi"}
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(UPSTREAM_BODY, "text/event-stream"),
            )
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_non_stream_completion() {
        let server = MockServer::start().await;
        mount_backend(&server, 1).await;
        let service = service_for(&server.uri(), false);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;

        assert_eq!(res.status_code, Some(StatusCode::OK));
        let completion: CompletionObject =
            serde_json::from_str(&res.take_string().await.unwrap()).unwrap();
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "gpt-4o");
        assert_eq!(completion.content(), "Hello\nWorld");
        assert_eq!(completion.choices[0].finish_reason, "stop");
    }

    #[tokio::test]
    async fn test_non_stream_completion_legacy_sentinel() {
        let server = MockServer::start().await;
        mount_backend(&server, 1).await;
        let service = service_for(&server.uri(), true);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;

        let completion: CompletionObject =
            serde_json::from_str(&res.take_string().await.unwrap()).unwrap();
        assert_eq!(completion.content(), "Hello trylimit\nWorld");
    }

    #[tokio::test]
    async fn test_stream_completion() {
        let server = MockServer::start().await;
        mount_backend(&server, 1).await;
        let service = service_for(&server.uri(), false);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o-2024-05-13", true))
            .send(&service)
            .await;

        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let body = res.take_string().await.unwrap();
        let events: Vec<&str> = body
            .split("\n\n")
            .filter(|e| !e.is_empty())
            .map(|e| e.strip_prefix("data: ").unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(events[2], "[DONE]");
        let contents: Vec<String> = events[..2]
            .iter()
            .map(|e| {
                let chunk: Value = serde_json::from_str(e).unwrap();
                assert_eq!(chunk["object"], "chat.completion.chunk");
                assert_eq!(chunk["model"], "gpt-4o-2024-05-13");
                chunk["choices"][0]["delta"]["content"]
                    .as_str()
                    .unwrap()
                    .to_owned()
            })
            .collect();
        assert_eq!(contents, vec!["Hello", "\nWorld"]);
    }

    #[tokio::test]
    async fn test_disallowed_model_never_reaches_backend() {
        let server = MockServer::start().await;
        mount_backend(&server, 0).await;
        let service = service_for(&server.uri(), false);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-3.5-turbo", false))
            .send(&service)
            .await;

        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
        let body: Value = serde_json::from_str(&res.take_string().await.unwrap()).unwrap();
        assert_eq!(
            body["detail"],
            "Model gpt-3.5-turbo is not allowed. Allowed models are: gpt-4o, gpt-4o-2024-05-13"
        );
        server.verify().await;
    }

    #[tokio::test]
    async fn test_auth_failures_never_reach_backend() {
        let server = MockServer::start().await;
        mount_backend(&server, 0).await;
        let service = service_for(&server.uri(), false);

        let res = TestClient::post(URL)
            .bearer_auth("wrong")
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));

        let res = TestClient::post(URL)
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_invalid_body_is_unprocessable() {
        let server = MockServer::start().await;
        mount_backend(&server, 0).await;
        let service = service_for(&server.uri(), false);

        let res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&json!({"model": "gpt-4o"}))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[tokio::test]
    async fn test_upstream_status_error_is_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/send2/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(1)
            .mount(&server)
            .await;
        let service = service_for(&server.uri(), false);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o", true))
            .send(&service)
            .await;

        assert_eq!(res.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
        let body: Value = serde_json::from_str(&res.take_string().await.unwrap()).unwrap();
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Error communicating with backend"));
        assert!(detail.contains("503"));
        assert!(detail.contains("busy"));
    }

    #[tokio::test]
    async fn test_upstream_error_body_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/send2/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("x".repeat(100_000)))
            .expect(1)
            .mount(&server)
            .await;
        let service = service_for(&server.uri(), false);

        let mut res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;

        assert_eq!(res.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
        let body: Value = serde_json::from_str(&res.take_string().await.unwrap()).unwrap();
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("503"));
        assert!(detail.len() < 1000);
    }

    #[tokio::test]
    async fn test_listener_binds_configured_address() {
        let config = Config {
            listen: "127.0.0.1:0".to_owned(),
            ..Config::default()
        };
        // 监听地址来自配置快照，listener 需要持有自己的副本
        let listen = config.listen.clone();
        drop(config);
        assert!(TcpListener::new(listen).try_bind().await.is_ok());
    }

    #[tokio::test]
    async fn test_upstream_unreachable_is_500() {
        // 端口 1 上没有服务监听
        let service = service_for("http://127.0.0.1:1", false);

        let res = TestClient::post(URL)
            .bearer_auth(SECRET)
            .json(&chat_body("gpt-4o", false))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_preflight_needs_no_auth() {
        let service = service_for("http://127.0.0.1:1", false);

        let res = TestClient::options(URL).send(&service).await;

        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(
            res.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(
            res.headers().get("access-control-allow-methods").unwrap(),
            "POST, OPTIONS"
        );
        assert_eq!(
            res.headers().get("access-control-allow-headers").unwrap(),
            "Content-Type, Authorization"
        );
    }
}
