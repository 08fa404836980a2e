mod utils;

use std::sync::Arc;

use futures_util::StreamExt;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL, CONTENT_TYPE, HeaderValue,
};
use http_body_util::BodyExt;
use salvo::{http::ResBody, prelude::*};

use crate::{
    config::{AtomicConfig, Config},
    gateway::{
        HttpClient, backend,
        error::GatewayError,
        handler::utils::{bearer_token, setup_handler_state},
        model::{ChatRequest, CompletionObject},
        service::{log_request_body, log_response_body},
        translator,
    },
};

/// 所有响应都允许跨域访问
#[handler]
pub async fn allow_any_origin(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    ctrl.call_next(req, depot, res).await;
    res.headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
}

/// CORS 预检
#[handler]
pub async fn chat_completions_options(res: &mut Response) {
    res.status_code(StatusCode::OK);
    let headers = res.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

/// 校验 Bearer 密钥，未配置密钥时拒绝所有请求
#[handler]
pub async fn verify_app_secret(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    let Ok(config) = depot.obtain::<Arc<AtomicConfig>>() else {
        tracing::error!("AtomicConfig not found in depot");
        res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
        ctrl.skip_rest();
        return;
    };
    let config = config.get();

    let verdict = match (bearer_token(req), config.app_secret.as_deref()) {
        (None, _) => Err(GatewayError::MissingCredentials),
        (Some(token), Some(secret)) if token == secret => Ok(()),
        (Some(_), _) => Err(GatewayError::InvalidSecret),
    };

    if let Err(e) = verdict {
        tracing::warn!("🔒 鉴权失败: {}", e);
        e.render_into(res);
        ctrl.skip_rest();
    }
}

/// `POST /v1/chat/completions`
#[handler]
pub async fn chat_completions(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let (config, client) = match setup_handler_state(depot) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to get dependencies from depot: {e}");
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            return;
        }
    };

    if let Err(e) = relay_chat(req, res, &config, &client).await {
        if e.status_code().is_server_error() {
            tracing::error!("❌ {}", e);
        } else {
            tracing::warn!("{}", e);
        }
        e.render_into(res);
    }
}

async fn relay_chat(
    req: &mut Request,
    res: &mut Response,
    config: &Config,
    client: &HttpClient,
) -> Result<(), GatewayError> {
    let body = BodyExt::collect(req.body_mut())
        .await
        .map_err(|e| GatewayError::InvalidBody(e.to_string()))?
        .to_bytes();
    if config.log_req_body {
        log_request_body(&String::from_utf8_lossy(&body));
    }

    let request: ChatRequest =
        serde_json::from_slice(&body).map_err(|e| GatewayError::InvalidBody(e.to_string()))?;
    tracing::info!(
        "Received chat completion request for model: {}",
        request.model
    );

    // 模型校验必须先于上游调用
    if !config.is_model_allowed(&request.model) {
        return Err(GatewayError::ModelNotAllowed {
            model: request.model,
            allowed: config.allowed_models.clone(),
        });
    }

    let upstream = backend::send_chat(client, &config.backend, &request.messages).await?;
    let lines = backend::body_lines(upstream);

    if request.is_stream() {
        tracing::info!("=== Streaming response ===");
        let log_events = config.log_res_body;
        let events = translator::sse_events(lines, request.model).inspect(move |event| {
            if log_events
                && let Ok(bytes) = event
                && let Ok(s) = std::str::from_utf8(bytes)
            {
                tracing::info!("{}", s.trim_end());
            }
        });

        res.status_code(StatusCode::OK);
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        res.headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        res.body(ResBody::stream(events));
        return Ok(());
    }

    tracing::info!("=== Non-streaming response ===");
    let text =
        translator::collect_full_text(lines, config.keep_sentinel_in_full_response).await?;
    let completion = CompletionObject::new(&request.model, text);

    if config.log_res_body
        && let Ok(body) = serde_json::to_string(&completion)
    {
        log_response_body(&body);
    }
    tracing::info!(
        "Response generated successfully ({} chars)",
        completion.content().chars().count()
    );

    res.status_code(StatusCode::OK);
    res.render(Json(completion));
    Ok(())
}
