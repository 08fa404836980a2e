pub mod format;

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use format::normalize_config_file;
use notify::{
    EventKind, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// 覆盖配置文件中 `app_secret` 的环境变量
pub const APP_SECRET_ENV: &str = "APP_SECRET";

/// 全局原子配置，支持热重载
///
/// 每个请求通过 [`AtomicConfig::get`] 拿到一份不可变快照，
/// 重载只替换快照本身，不会影响正在处理中的请求。
pub struct AtomicConfig {
    inner: ArcSwap<Config>,
    config_path: PathBuf,
}

/// 上游聊天后端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// 后端根地址，同时用于 origin / referer 头
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 聊天接口路径
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// 附加请求头（同名时覆盖自动生成的 origin / referer）
    #[serde(default = "default_backend_headers")]
    pub headers: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            headers: default_backend_headers(),
        }
    }
}

/// 配置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// 监听地址（修改后需重启生效）
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 客户端 Bearer 密钥；为空时拒绝所有请求
    #[serde(default)]
    pub app_secret: Option<String>,
    /// 允许的模型列表
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,
    /// 是否打印请求体
    #[serde(default)]
    pub log_req_body: bool,
    /// 是否打印响应体
    #[serde(default)]
    pub log_res_body: bool,
    /// 非流式响应中保留 " trylimit" 限流标记（旧行为）
    #[serde(default)]
    pub keep_sentinel_in_full_response: bool,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            app_secret: None,
            allowed_models: default_allowed_models(),
            log_req_body: false,
            log_res_body: false,
            keep_sentinel_in_full_response: false,
            backend: BackendConfig::default(),
        }
    }
}

impl Config {
    pub fn is_model_allowed(&self, model: &str) -> bool {
        self.allowed_models.iter().any(|m| m == model)
    }

    /// 环境变量中的密钥优先于配置文件
    fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = env::var(APP_SECRET_ENV)
            && !secret.is_empty()
        {
            self.app_secret = Some(secret);
        }
        self
    }
}

fn default_listen() -> String {
    "0.0.0.0:8001".to_owned()
}

fn default_allowed_models() -> Vec<String> {
    vec!["gpt-4o".to_owned(), "gpt-4o-2024-05-13".to_owned()]
}

fn default_base_url() -> String {
    "https://ai-chats.org".to_owned()
}

fn default_chat_path() -> String {
    "/chat/send2/".to_owned()
}

fn default_backend_headers() -> BTreeMap<String, String> {
    [
        ("accept", "application/json, text/event-stream"),
        ("accept-language", "zh-CN,zh;q=0.9"),
        ("content-type", "application/json"),
        (
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

impl AtomicConfig {
    /// 初始化配置，从指定路径或默认路径加载
    pub fn init() -> Self {
        let config_path = env::args()
            .nth(1)
            .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from);

        info!("📂 正在加载配置文件: {:?}", config_path);

        if config_path.exists() {
            if let Err(e) = normalize_config_file(&config_path) {
                warn!("写入格式化配置失败: {}", e);
            }
        } else {
            warn!("配置文件不存在，使用默认配置");
        }

        let config = Self::load_from_file(&config_path).unwrap_or_else(|e| {
            warn!("⚠️  配置加载失败: {}，退出中", e);
            process::exit(1);
        });

        log_config(&config);
        if config.app_secret.is_none() {
            warn!("未设置 app_secret（或环境变量 {APP_SECRET_ENV}），所有请求都会被拒绝");
        }

        Self::from_config(config, config_path)
    }

    /// 直接使用已有配置构建（不读取文件）
    pub fn from_config(config: Config, config_path: PathBuf) -> Self {
        Self {
            inner: ArcSwap::from(Arc::new(config)),
            config_path,
        }
    }

    /// 从文件加载配置，文件不存在时使用默认值
    fn load_from_file(path: impl AsRef<Path>) -> Result<Config, String> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {e}"))?
        } else {
            String::new()
        };

        let config: Config =
            toml::from_str(&content).map_err(|e| format!("Failed to parse TOML: {e}"))?;

        Ok(config.with_env_overrides())
    }

    /// 获取当前配置快照
    pub fn get(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// 重新加载配置
    pub fn reload(&self) {
        // 等待文件写入完成
        std::thread::sleep(Duration::from_millis(50));

        info!("🔄 检测到配置文件变更，正在重新加载...");

        match Self::load_from_file(&self.config_path) {
            Ok(new_config) => {
                let old = self.inner.load_full();
                if *old == new_config {
                    info!("ℹ️ 配置文件内容未变化");
                    return;
                }

                if old.listen != new_config.listen {
                    warn!(
                        "listen: {} -> {}（需重启服务才能生效）",
                        old.listen, new_config.listen
                    );
                }
                if old.backend != new_config.backend {
                    info!(
                        "backend: {}{} -> {}{}",
                        old.backend.base_url,
                        old.backend.chat_path,
                        new_config.backend.base_url,
                        new_config.backend.chat_path
                    );
                }
                if old.allowed_models != new_config.allowed_models {
                    info!(
                        "allowed_models: {:?} -> {:?}",
                        old.allowed_models, new_config.allowed_models
                    );
                }
                if old.app_secret != new_config.app_secret {
                    info!("app_secret 已更新");
                }

                self.inner.store(Arc::new(new_config));
                info!("✅ 配置已更新");
            }
            Err(e) => {
                error!("❌ 配置重载失败: {}", e);
            }
        }
    }

    /// 启动配置文件监听（跨平台）
    ///
    /// 使用 `notify` crate 监听配置文件，写入关闭后自动重载
    pub fn start_watcher(self: Arc<Self>) {
        if !self.config_path.exists() {
            info!("配置文件不存在，跳过监听");
            return;
        }

        std::thread::spawn(move || {
            let config_path = self.config_path.clone();

            let mut watcher =
                match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                    match res {
                        Ok(event) => {
                            if matches!(
                                event.kind,
                                EventKind::Access(AccessKind::Close(AccessMode::Write))
                            ) {
                                self.reload();
                            }
                        }
                        Err(e) => error!("Config watch error: {}", e),
                    }
                }) {
                    Ok(w) => w,
                    Err(e) => {
                        error!("Failed to initialize watcher: {}", e);
                        return;
                    }
                };

            if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
                error!("Failed to add watch for config file: {}", e);
                return;
            }

            info!("👁️  配置文件监听已启动: {:?}", config_path);

            // 挂起线程，保持 watcher 存活
            std::thread::park();
        });
    }
}

fn log_config(config: &Config) {
    info!("✅ 配置已加载:");
    info!("listen: {}", config.listen);
    info!(
        "backend: {}{} (headers={} 个)",
        config.backend.base_url,
        config.backend.chat_path,
        config.backend.headers.len()
    );
    info!("allowed_models: {}", config.allowed_models.join(", "));
    if let Some(secret) = &config.app_secret {
        info!(
            "app_secret: {}***",
            secret.chars().take(4).collect::<String>()
        );
    }
    info!(
        "keep_sentinel_in_full_response: {}",
        config.keep_sentinel_in_full_response
    );
    info!("log_req_body: {}", config.log_req_body);
    info!("log_res_body: {}", config.log_res_body);
}
