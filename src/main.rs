mod config;
mod gateway;

use std::{fmt, io::IsTerminal, sync::Arc};

use chrono::Local;
use config::AtomicConfig;
use gateway::GatewayHandler;
use salvo::prelude::*;
use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    fmt::{format::Writer, time::FormatTime},
};

struct LoggerFormatter;

impl FormatTime for LoggerFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(LoggerFormatter)
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    // 初始化配置并启动热重载监听
    let atomic_config = Arc::new(AtomicConfig::init());
    let listen = atomic_config.get().listen.clone();
    Arc::clone(&atomic_config).start_watcher();

    let gateway = GatewayHandler::new();
    let router = gateway.router(atomic_config);

    let acceptor = TcpListener::new(listen.clone()).bind().await;
    info!("Server listening on {}", listen);

    Server::new(acceptor).serve(router).await;

    Ok(())
}
