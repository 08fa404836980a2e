use std::sync::Arc;

use anyhow::{Result, bail};
use salvo::prelude::*;

use crate::{
    config::{AtomicConfig, Config},
    gateway::HttpClient,
};

/// 从 depot 取出本次请求使用的配置快照和共享 HTTP 客户端
pub fn setup_handler_state(depot: &Depot) -> Result<(Arc<Config>, Arc<HttpClient>)> {
    let Ok(config) = depot.obtain::<Arc<AtomicConfig>>() else {
        bail!("AtomicConfig not found in depot");
    };
    let Ok(client) = depot.obtain::<Arc<HttpClient>>() else {
        bail!("HttpClient not found in depot");
    };
    Ok((config.get(), Arc::clone(client)))
}

/// 提取 `Authorization: Bearer <token>` 中的 token
pub fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
