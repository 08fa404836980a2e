use salvo::prelude::*;
use serde_json::json;
use thiserror::Error;

use super::translator::TranslateError;

/// 请求处理失败的原因，统一映射为 `{"detail": ...}` 错误响应
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Not authenticated")]
    MissingCredentials,
    #[error("Invalid APP_SECRET")]
    InvalidSecret,
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Model {model} is not allowed. Allowed models are: {}", .allowed.join(", "))]
    ModelNotAllowed { model: String, allowed: Vec<String> },
    #[error("Error communicating with backend: {0}")]
    UpstreamConnection(String),
    #[error("Error communicating with backend: upstream returned {status}: {message}")]
    UpstreamStatus { status: StatusCode, message: String },
    #[error("Error communicating with backend: {0}")]
    Translate(#[from] TranslateError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredentials | Self::InvalidSecret => StatusCode::FORBIDDEN,
            Self::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelNotAllowed { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamConnection(_)
            | Self::UpstreamStatus { .. }
            | Self::Translate(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 写入错误响应
    pub fn render_into(&self, res: &mut Response) {
        res.status_code(self.status_code());
        res.render(Json(json!({ "detail": self.to_string() })));
    }
}
