//! 上游聊天后端调用
//!
//! `OpenAI` messages → 后端 `messagesHistory`：
//! - role `user` → `from: "you"`
//! - 其他角色 → `from: "chatGPT"`

use std::collections::BTreeMap;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::{Request as HyperRequest, body::Incoming};
use rayon::prelude::*;
use serde::Serialize;

use super::{
    HttpClient,
    error::GatewayError,
    model::{ChatMessage, Role},
    translator::{LineStream, upstream_lines},
};
use crate::config::BackendConfig;

/// 错误响应体最多保留的字符数
const ERROR_BODY_CHARS: usize = 512;
/// 错误响应体最多读取的字节数（UTF-8 单字符最多 4 字节）
const ERROR_BODY_BYTES: usize = ERROR_BODY_CHARS * 4;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HistoryEntry<'a> {
    pub from: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPayload<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub messages_history: Vec<HistoryEntry<'a>>,
}

impl<'a> BackendPayload<'a> {
    pub fn from_messages(messages: &'a [ChatMessage]) -> Self {
        let messages_history = messages
            .par_iter()
            .map(|msg| HistoryEntry {
                from: if msg.role == Role::User {
                    "you"
                } else {
                    "chatGPT"
                },
                content: &msg.content,
            })
            .collect();
        Self {
            kind: "chat",
            messages_history,
        }
    }
}

/// 后端完整 URL
pub fn chat_url(backend: &BackendConfig) -> String {
    let base = backend.base_url.trim_end_matches('/');
    let path = backend.chat_path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// 最终发送的请求头：origin / referer 由 `base_url` 推导，配置中的同名头优先
fn request_headers(backend: &BackendConfig) -> BTreeMap<String, String> {
    let base = backend.base_url.trim_end_matches('/');
    let mut headers = BTreeMap::from([
        ("origin".to_owned(), base.to_owned()),
        ("referer".to_owned(), format!("{base}/chat/")),
    ]);
    headers.extend(
        backend
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
    );
    headers
}

pub fn build_request(
    backend: &BackendConfig,
    messages: &[ChatMessage],
) -> Result<HyperRequest<Full<Bytes>>, GatewayError> {
    let payload = BackendPayload::from_messages(messages);
    let body = serde_json::to_vec(&payload)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize payload: {e}")))?;

    let mut builder = HyperRequest::builder()
        .method(hyper::Method::POST)
        .uri(chat_url(backend));
    for (name, value) in request_headers(backend) {
        builder = builder.header(name, value);
    }

    builder
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| GatewayError::Internal(format!("Failed to build backend request: {e}")))
}

/// 发送请求并检查状态码，成功时返回上游响应体
pub async fn send_chat(
    client: &HttpClient,
    backend: &BackendConfig,
    messages: &[ChatMessage],
) -> Result<Incoming, GatewayError> {
    let request = build_request(backend, messages)?;
    tracing::info!("Proxying to: {}", request.uri());

    let response = client
        .request(request)
        .await
        .map_err(|e| GatewayError::UpstreamConnection(e.to_string()))?;
    let (parts, body) = response.into_parts();

    if !parts.status.is_success() {
        return Err(GatewayError::UpstreamStatus {
            status: parts.status,
            message: read_error_body(body).await,
        });
    }

    Ok(body)
}

/// 读取错误响应体的开头部分，超过上限后不再继续读取
async fn read_error_body<B>(mut body: B) -> String
where
    B: hyper::body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut buf = Vec::new();
    while buf.len() < ERROR_BODY_BYTES {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    buf.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => return format!("<failed to read body: {e}>"),
            None => break,
        }
    }
    String::from_utf8_lossy(&buf)
        .chars()
        .take(ERROR_BODY_CHARS)
        .collect()
}

/// 上游响应体 → 行流
pub fn body_lines(body: Incoming) -> LineStream {
    let data = BodyStream::new(body).filter_map(|frame| async move {
        match frame {
            Ok(f) => f.into_data().ok().map(Ok),
            Err(e) => Some(Err(e)),
        }
    });
    upstream_lines(Box::pin(data))
}
